//! Data-connection commands of one client session
//!
//! `DataConnectionController` owns the session's `TransferState` and turns
//! PRET/PORT/PASV/RETR/STOR and the TLS negotiation commands into replies.
//! A data transfer runs on a slave; the controller only binds the slave,
//! starts the transfer and polls it until it finishes.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use super::account::Rule;
use super::state::{DataMode, PlannedTransfer, TransferState};
use super::Direction;
use crate::checksum::{self, format_checksum};
use crate::error::{TransferError, VfsError, VfsResult};
use crate::log::{TransferLogEntry, TransferStatus};
use crate::protocol::reply;
use crate::protocol::timeouts::{DATA_ACCEPT_MS, STATUS_POLL_MS};
use crate::protocol_core::{is_legal_file_name, join_path};
use crate::session::Context;
use crate::slave::data::DataStream;
use crate::slave::{SelectionContext, SlaveHandle, Transfer, TransferProgress};
use crate::vfs::Node;

/// A numbered FTP reply; comments go out as continuation lines before the
/// final line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub message: String,
    pub comments: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            comments: Vec::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comments.push(comment.into());
        self
    }

    pub fn add_comment(&mut self, comment: impl Into<String>) {
        self.comments.push(comment.into());
    }

    pub fn ok() -> Self {
        Self::new(reply::COMMAND_OK, "Command okay")
    }

    pub fn syntax_error() -> Self {
        Self::new(reply::SYNTAX_ERROR, "Syntax error in parameters or arguments")
    }

    pub fn bad_sequence() -> Self {
        Self::new(reply::BAD_SEQUENCE, "Bad sequence of commands")
    }

    pub fn not_implemented() -> Self {
        Self::new(reply::NOT_IMPLEMENTED, "Command not implemented")
    }

    pub fn not_implemented_for_parm() -> Self {
        Self::new(
            reply::NOT_IMPLEMENTED_FOR_PARM,
            "Command not implemented for that parameter",
        )
    }

    pub fn slave_unavailable() -> Self {
        Self::new(reply::SLAVE_UNAVAILABLE, "No transfer-slave(s) available")
    }

    pub fn action_not_taken() -> Self {
        Self::new(
            reply::ACTION_NOT_TAKEN,
            "Requested action not taken. File unavailable.",
        )
    }

    pub fn file_exists() -> Self {
        Self::new(
            reply::FILE_NAME_NOT_ALLOWED,
            "Requested action not taken. File exists.",
        )
    }

    pub fn name_not_allowed() -> Self {
        Self::new(
            reply::FILE_NAME_NOT_ALLOWED,
            "Requested action not taken. File name not allowed.",
        )
    }

    pub fn access_denied() -> Self {
        Self::new(reply::ACCESS_DENIED, "Access denied")
    }

    /// Wire form, CRLF terminated
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for c in &self.comments {
            out.push_str(&format!("{}-{}\r\n", self.code, c));
        }
        out.push_str(&format!("{} {}\r\n", self.code, self.message));
        out
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Session facts the controller needs besides its state
struct Env {
    ctx: Arc<Context>,
    session_id: String,
    user: String,
    group: String,
    control_peer: SocketAddr,
    control_local: SocketAddr,
    secure_control: bool,
}

/// Resets the state whichever way the borrow ends
struct ResetOnExit<'a>(&'a mut TransferState);

impl Deref for ResetOnExit<'_> {
    type Target = TransferState;
    fn deref(&self) -> &TransferState {
        self.0
    }
}

impl DerefMut for ResetOnExit<'_> {
    fn deref_mut(&mut self) -> &mut TransferState {
        self.0
    }
}

impl Drop for ResetOnExit<'_> {
    fn drop(&mut self) {
        self.0.reset();
    }
}

pub struct DataConnectionController {
    env: Env,
    state: TransferState,
}

impl DataConnectionController {
    pub fn new(
        ctx: Arc<Context>,
        user: &str,
        group: &str,
        control_peer: SocketAddr,
        control_local: SocketAddr,
    ) -> Self {
        Self {
            env: Env {
                ctx,
                session_id: uuid::Uuid::new_v4().to_string(),
                user: user.to_string(),
                group: group.to_string(),
                control_peer,
                control_local,
                secure_control: false,
            },
            state: TransferState::new(),
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn user(&self) -> &str {
        &self.env.user
    }

    /// Random id tagging this session's log lines and transfer log entries
    pub fn session_id(&self) -> &str {
        &self.env.session_id
    }

    pub fn set_user(&mut self, user: &str, group: &str) {
        self.env.user = user.to_string();
        self.env.group = group.to_string();
    }

    /// The control channel completed its TLS handshake
    pub fn set_secure_control(&mut self, secure: bool) {
        self.env.secure_control = secure;
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// `AUTH TLS`. A 234 reply means the caller must upgrade the control
    /// channel right after sending it.
    pub fn auth(&self, arg: Option<&str>) -> Reply {
        let Some(arg) = arg else {
            return Reply::syntax_error();
        };
        if self.env.ctx.tls.is_none() {
            return Reply::new(reply::TLS_NOT_CONFIGURED, "TLS not configured");
        }
        match arg.to_ascii_uppercase().as_str() {
            "TLS" | "SSL" | "TLS-C" | "TLS-P" => {
                Reply::new(reply::AUTH_OK, format!("AUTH {} successful", arg))
            }
            _ => Reply::not_implemented_for_parm(),
        }
    }

    pub fn pbsz(&self, arg: Option<&str>) -> Reply {
        match arg {
            Some("0") => Reply::ok(),
            _ => Reply::syntax_error(),
        }
    }

    fn require_secure_channel(&self) -> Option<Reply> {
        if self.env.ctx.tls.is_none() {
            return Some(Reply::new(reply::SYNTAX_ERROR_COMMAND, "TLS not configured"));
        }
        if !self.env.secure_control {
            return Some(Reply::new(
                reply::SYNTAX_ERROR_COMMAND,
                "You are not on a secure channel",
            ));
        }
        None
    }

    pub fn prot(&mut self, arg: Option<&str>) -> Reply {
        if let Some(r) = self.require_secure_channel() {
            return r;
        }
        let Some(arg) = arg else {
            self.state.encrypted = false;
            return Reply::ok();
        };
        match arg.to_ascii_uppercase().as_str() {
            "C" => {
                self.state.encrypted = false;
                Reply::ok()
            }
            "P" => {
                self.state.encrypted = true;
                Reply::ok()
            }
            _ => Reply::syntax_error(),
        }
    }

    pub fn sscn(&mut self, arg: Option<&str>) -> Reply {
        if let Some(r) = self.require_secure_channel() {
            return r;
        }
        if !self.state.encrypted {
            return Reply::new(
                reply::SYNTAX_ERROR_COMMAND,
                "SSCN only works for encrypted transfers",
            );
        }
        match arg.map(|a| a.to_ascii_uppercase()) {
            Some(a) if a == "ON" => self.state.client_mode = true,
            Some(a) if a == "OFF" => self.state.client_mode = false,
            Some(_) => return Reply::syntax_error(),
            None => {}
        }
        let method = if self.state.client_mode { "CLIENT" } else { "SERVER" };
        Reply::new(reply::SERVICE_READY, format!("SSCN:{} METHOD", method))
    }

    pub fn mode(&self, arg: Option<&str>) -> Reply {
        match arg {
            None => Reply::syntax_error(),
            Some(a) if a.eq_ignore_ascii_case("S") => Reply::ok(),
            Some(_) => Reply::not_implemented_for_parm(),
        }
    }

    pub fn stru(&self, arg: Option<&str>) -> Reply {
        match arg {
            None => Reply::syntax_error(),
            Some(a) if a.eq_ignore_ascii_case("F") => Reply::ok(),
            Some(_) => Reply::not_implemented_for_parm(),
        }
    }

    pub fn type_(&mut self, arg: Option<&str>) -> Reply {
        let Some(code) = arg.and_then(|a| a.chars().next()) else {
            return Reply::syntax_error();
        };
        if self.state.set_type(code) {
            Reply::ok()
        } else {
            Reply::not_implemented_for_parm()
        }
    }

    pub fn rest(&mut self, arg: Option<&str>) -> Reply {
        match arg.map(|a| a.trim().parse::<u64>()) {
            Some(Ok(offset)) => {
                self.state.resume = offset;
                Reply::new(
                    reply::PENDING_FURTHER_INFORMATION,
                    "Requested file action pending further information.",
                )
            }
            _ => {
                self.state.reset();
                Reply::syntax_error()
            }
        }
    }

    /// `PRET <command> [path]`: announce the next transfer so that PASV can
    /// pick the right data endpoint. For slave transfers the slave is bound
    /// here and reused by PORT/PASV and the transfer itself.
    pub fn pret(&mut self, cwd: &Arc<Node>, arg: Option<&str>) -> Reply {
        self.state.reset();
        let Some(arg) = arg else {
            return Reply::syntax_error();
        };
        let (cmd, target) = match arg.trim().split_once(' ') {
            Some((c, t)) => (c.to_ascii_uppercase(), Some(t.trim())),
            None => (arg.trim().to_ascii_uppercase(), None),
        };

        let planned = match cmd.as_str() {
            "LIST" | "NLST" => {
                self.state.pret = Some(PlannedTransfer::List { command: cmd });
                return Reply::new(
                    reply::COMMAND_OK,
                    "OK, planning to use master for upcoming LIST transfer",
                );
            }
            "RETR" => {
                let Some(target) = target else {
                    return Reply::syntax_error();
                };
                match self.env.download_target(cwd, target) {
                    Ok(file) => PlannedTransfer::Retr { file },
                    Err(r) => return r,
                }
            }
            "STOR" => {
                let Some(target) = target else {
                    return Reply::syntax_error();
                };
                match self.env.upload_target(cwd, target) {
                    Ok((dir, name)) => PlannedTransfer::Stor { dir, name },
                    Err(r) => return r,
                }
            }
            _ => return Reply::not_implemented_for_parm(),
        };

        match self.env.select_slave(&planned) {
            Ok(slave) => {
                debug!("PRET {} bound {}", planned.command(), slave.name());
                self.state.slave = Some(slave);
            }
            // reported when the transfer is set up
            Err(e) => debug!("PRET {}: {}", planned.command(), e),
        }
        let message = match planned {
            PlannedTransfer::Retr { .. } => "OK, planning for upcoming download",
            _ => "OK, planning for upcoming upload",
        };
        self.state.pret = Some(planned);
        Reply::new(reply::COMMAND_OK, message)
    }

    /// `PORT h1,h2,h3,h4,p1,p2`
    pub fn port(&mut self, arg: Option<&str>) -> Reply {
        let Some(arg) = arg else {
            return Reply::syntax_error();
        };
        let tokens: Vec<&str> = arg.trim().split(',').map(str::trim).collect();
        if tokens.len() != 6 {
            return Reply::syntax_error();
        }
        let Ok(host) = tokens[..4].join(".").parse::<Ipv4Addr>() else {
            return Reply::syntax_error();
        };

        let port_host = host.to_string();
        let control_host = self.env.control_peer.ip().to_string();
        let behind_nat = (port_host.starts_with("192.168.") && !control_host.starts_with("192.168."))
            || (port_host.starts_with("10.") && !control_host.starts_with("10."));
        if behind_nat {
            self.state.reset();
            return Reply::syntax_error()
                .with_comment("==YOU'RE BEHIND A NAT ROUTER==")
                .with_comment("Configure the firewall settings of your FTP client")
                .with_comment(format!("  to use your real IP: {}", control_host))
                .with_comment("And set up port forwarding in your router.")
                .with_comment("Or you can just use a PRET capable client");
        }

        let (Ok(hi), Ok(lo)) = (tokens[4].parse::<u8>(), tokens[5].parse::<u8>()) else {
            self.state.reset();
            return Reply::syntax_error();
        };
        let port = (u16::from(hi) << 8) | u16::from(lo);
        self.state.mode = Some(DataMode::Port(SocketAddr::new(IpAddr::V4(host), port)));

        let mut r = Reply::new(reply::COMMAND_OK, "PORT command successful");
        if port_host.starts_with("127.") {
            r.add_comment("Ok, but distributed transfers won't work with local addresses");
        }
        if IpAddr::V4(host) != self.env.control_peer.ip() {
            r.add_comment(format!(
                "FXP allowed. If you're not FXPing then set your IP to {} (usually in firewall settings)",
                control_host
            ));
        }

        if let Some(planned) = self.state.pret.clone() {
            if planned.is_local() {
                r.add_comment("Using master for upcoming transfer");
            } else {
                let bound = self.state.slave.clone().filter(|s| s.is_available());
                let slave = match bound {
                    Some(s) => Some(s),
                    None => self.env.select_slave(&planned).ok(),
                };
                // a missing slave is reported by the transfer command
                if let Some(s) = &slave {
                    r.add_comment(format!("Using {} for upcoming transfer", s.name()));
                }
                self.state.slave = slave;
            }
        }
        r
    }

    /// `PASV` / `CPSV`. Only valid after PRET: the data endpoint depends on
    /// what is going to be transferred.
    pub async fn pasv(&mut self, cpsv: bool) -> Reply {
        let Some(planned) = self.state.pret.clone() else {
            self.state.reset();
            return Reply::new(
                reply::SYNTAX_ERROR_COMMAND,
                "You need to use a client supporting PRET (PRE Transfer) to use PASV",
            );
        };
        if cpsv {
            self.state.client_mode = true;
        }
        let result = if planned.is_local() {
            self.local_passive().await
        } else {
            self.slave_passive(&planned).await
        };
        if cpsv {
            self.state.client_mode = false;
        }

        let (addr, using) = match result {
            Ok(v) => v,
            Err(r) => {
                self.state.reset();
                return r;
            }
        };
        let IpAddr::V4(ip) = addr.ip() else {
            let r = Reply::new(
                reply::SYNTAX_ERROR_COMMAND,
                format!("Address is unresolvable, check pasv_address setting on {}", using),
            );
            self.state.reset();
            return r;
        };
        self.state.mode = Some(DataMode::Pasv);
        let o = ip.octets();
        Reply::new(
            reply::ENTERING_PASSIVE,
            format!(
                "Entering Passive Mode ({},{},{},{},{},{}).",
                o[0],
                o[1],
                o[2],
                o[3],
                addr.port() >> 8,
                addr.port() & 0xff
            ),
        )
        .with_comment(format!("Using {} for upcoming transfer", using))
    }

    async fn local_passive(&mut self) -> Result<(SocketAddr, String), Reply> {
        let bind_ip = self.env.control_local.ip();
        let listener = TcpListener::bind((bind_ip, 0))
            .await
            .map_err(|e| Reply::new(reply::SYNTAX_ERROR_COMMAND, e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| Reply::new(reply::SYNTAX_ERROR_COMMAND, e.to_string()))?
            .port();
        let advertised = self
            .env
            .ctx
            .config
            .pasv_address
            .as_deref()
            .and_then(|a| a.parse::<IpAddr>().ok())
            .unwrap_or(bind_ip);
        self.state.local_listener = Some(listener);
        Ok((SocketAddr::new(advertised, port), "master".to_string()))
    }

    /// Have a slave listen for the client. The PRET-bound slave goes first;
    /// every slave that fails is taken offline and a fresh one selected.
    async fn slave_passive(&mut self, planned: &PlannedTransfer) -> Result<(SocketAddr, String), Reply> {
        let mut preferred = self.state.slave.take().filter(|s| s.is_available());
        loop {
            if let PlannedTransfer::Retr { file } = planned {
                if file.is_deleted() {
                    return Err(Reply::action_not_taken());
                }
            }
            let slave = match preferred.take() {
                Some(s) => s,
                None => match self.env.select_slave(planned) {
                    Ok(s) => s,
                    Err(VfsError::NotFound(_)) => return Err(Reply::action_not_taken()),
                    Err(_) => return Err(Reply::slave_unavailable()),
                },
            };
            let ticket = match slave.issue_listen(self.state.encrypted, self.state.client_mode) {
                Ok(t) => t,
                Err(e) => {
                    slave.mark_unavailable(&e.to_string());
                    continue;
                }
            };
            match slave.fetch_transfer(ticket).await {
                Ok(transfer) => {
                    let addr = transfer.addr();
                    let name = slave.name().to_string();
                    self.state.transfer = Some(transfer);
                    self.state.slave = Some(slave);
                    return Ok((addr, name));
                }
                Err(e) => {
                    error!("slave {} could not listen for a connection: {}", slave.name(), e);
                    slave.mark_unavailable("Slave could not listen for a connection");
                }
            }
        }
    }

    /// Connection for a transfer the master serves itself (LIST/NLST)
    pub async fn open_local_data(&mut self) -> Result<Box<dyn DataStream>, Reply> {
        let cant_open = |e: String| {
            Reply::new(reply::CANT_OPEN_DATA, "Can't open data connection.").with_comment(e)
        };
        let tcp = if let Some(listener) = self.state.local_listener.take() {
            match timeout(Duration::from_millis(DATA_ACCEPT_MS), listener.accept()).await {
                Ok(Ok((s, _))) => s,
                Ok(Err(e)) => return Err(cant_open(e.to_string())),
                Err(_) => return Err(cant_open("timed out waiting for the client".into())),
            }
        } else if let Some(addr) = self.state.port_address() {
            match timeout(Duration::from_millis(DATA_ACCEPT_MS), TcpStream::connect(addr)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(cant_open(e.to_string())),
                Err(_) => return Err(cant_open(format!("connect to {} timed out", addr))),
            }
        } else {
            return Err(Reply::bad_sequence());
        };
        let _ = tcp.set_nodelay(true);
        if !self.state.encrypted {
            return Ok(Box::new(tcp));
        }
        if self.state.client_mode {
            let peer = tcp.peer_addr().map_err(|e| cant_open(e.to_string()))?;
            let name = crate::tls::server_name_for(&peer.ip().to_string())
                .map_err(|e| cant_open(e.to_string()))?;
            let tls = crate::tls::data_channel_connector()
                .connect(name, tcp)
                .await
                .map_err(|e| cant_open(e.to_string()))?;
            Ok(Box::new(tls))
        } else {
            let acceptor = self
                .env
                .ctx
                .tls
                .clone()
                .ok_or_else(|| cant_open("TLS not configured".into()))?;
            let tls = acceptor.accept(tcp).await.map_err(|e| cant_open(e.to_string()))?;
            Ok(Box::new(tls))
        }
    }

    /// `RETR`/`STOR` (and the refused `APPE`/`STOU`). Writes the 150
    /// preliminary reply to `out` and returns the final one. The state is
    /// back to idle afterwards, whatever the outcome. Setting `cancel` to
    /// true aborts a running transfer.
    pub async fn transfer<W>(
        &mut self,
        command: &str,
        cwd: &Arc<Node>,
        arg: Option<&str>,
        out: &mut W,
        mut cancel: watch::Receiver<bool>,
    ) -> Reply
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut st = ResetOnExit(&mut self.state);
        let env = &self.env;
        let direction = match command.to_ascii_uppercase().as_str() {
            "RETR" => Direction::Download,
            "STOR" => Direction::Upload,
            "APPE" | "STOU" => return Reply::not_implemented(),
            _ => return Reply::bad_sequence(),
        };
        let Some(arg) = arg else {
            return Reply::syntax_error();
        };
        env.run_transfer(&mut st, direction, cwd, arg, out, &mut cancel)
            .await
    }
}

impl Env {
    fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Existing file for a download
    fn download_target(&self, cwd: &Arc<Node>, target: &str) -> Result<Arc<Node>, Reply> {
        match self.ctx().tree.lookup_file_from(cwd, target) {
            Ok(node) if node.is_file() => Ok(node),
            Ok(_) => Err(Reply::new(
                reply::ACTION_NOT_TAKEN,
                "Requested target is not a file",
            )),
            Err(_) => Err(Reply::action_not_taken()),
        }
    }

    /// Directory and name for a new upload
    fn upload_target(&self, cwd: &Arc<Node>, target: &str) -> Result<(Arc<Node>, String), Reply> {
        let resolved = self.ctx().tree.resolve_from(cwd, target);
        let Some(rest) = resolved.remainder else {
            return Err(Reply::file_exists());
        };
        if rest.contains('/') || !resolved.node.is_directory() {
            return Err(Reply::action_not_taken());
        }
        if !is_legal_file_name(&rest) {
            return Err(Reply::name_not_allowed());
        }
        Ok((resolved.node, rest))
    }

    /// Fresh selection for a planned slave transfer
    fn select_slave(&self, planned: &PlannedTransfer) -> VfsResult<Arc<SlaveHandle>> {
        let ctx = self.ctx();
        match planned {
            PlannedTransfer::Retr { file } => {
                if file.is_deleted() {
                    return Err(VfsError::NotFound(file.path()));
                }
                let candidates = file.available_slaves();
                ctx.selector
                    .select(&candidates, Direction::Download, &SelectionContext::for_file(file))
            }
            PlannedTransfer::Stor { dir, name } => {
                let candidates = ctx.slaves.available_slaves();
                let sel = SelectionContext::for_path(dir, &join_path(&dir.path(), name));
                ctx.selector.select(&candidates, Direction::Upload, &sel)
            }
            PlannedTransfer::List { command } => {
                Err(VfsError::NoAvailableSlave(format!("{} is served by the master", command)))
            }
        }
    }

    fn permitted(&self, rule: Rule, path: &str) -> bool {
        self.ctx()
            .permissions
            .check_path_permission(rule, &self.user, path, true)
    }

    async fn run_transfer<W>(
        &self,
        st: &mut TransferState,
        direction: Direction,
        cwd: &Arc<Node>,
        arg: &str,
        out: &mut W,
        cancel: &mut watch::Receiver<bool>,
    ) -> Reply
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let ctx = self.ctx();
        let deny_clear = ctx.config.deny_unencrypted_data
            || self.permitted(Rule::DenyUnencryptedData, &cwd.path());
        if deny_clear && !st.encrypted {
            return Reply::new(reply::ACCESS_DENIED, "USE SECURE DATA CONNECTION");
        }

        // what is transferred: the PRET plan, or the argument
        let planned = match st.pret.clone() {
            Some(p) if p.direction() == Some(direction) => {
                let wanted = ctx.tree.lookup_path(cwd, arg);
                let planned_path = match &p {
                    PlannedTransfer::Retr { file } => file.path(),
                    PlannedTransfer::Stor { dir, name } => join_path(&dir.path(), name),
                    PlannedTransfer::List { .. } => return Reply::bad_sequence(),
                };
                if wanted != planned_path {
                    debug!("PRET was for {}, {} asked for {}", planned_path, p.command(), wanted);
                    return Reply::new(
                        reply::BAD_SEQUENCE,
                        "Target does not match the preceding PRET",
                    );
                }
                p
            }
            Some(_) => return Reply::bad_sequence(),
            None => match direction {
                Direction::Download => match self.download_target(cwd, arg) {
                    Ok(file) => PlannedTransfer::Retr { file },
                    Err(r) => return r,
                },
                Direction::Upload => match self.upload_target(cwd, arg) {
                    Ok((dir, name)) => PlannedTransfer::Stor { dir, name },
                    Err(r) => return r,
                },
            },
        };

        let parent_path = match &planned {
            PlannedTransfer::Retr { file } => file.parent().map(|p| p.path()).unwrap_or_default(),
            PlannedTransfer::Stor { dir, .. } => dir.path(),
            PlannedTransfer::List { .. } => return Reply::bad_sequence(),
        };
        let rule = match direction {
            Direction::Download => Rule::Download,
            Direction::Upload => Rule::Upload,
        };
        if !self.permitted(rule, &parent_path) {
            return Reply::access_denied();
        }

        // bind the slave
        let slave = match (st.mode, st.slave.clone()) {
            (Some(DataMode::Pasv), Some(slave)) => {
                if let PlannedTransfer::Retr { file } = &planned {
                    if !file.has_slave(&slave) {
                        return Reply::bad_sequence();
                    }
                }
                slave
            }
            (Some(DataMode::Port(_)), Some(slave)) if slave.is_available() => slave,
            (Some(DataMode::Port(_)), _) => match self.select_slave(&planned) {
                Ok(s) => s,
                Err(VfsError::NotFound(_)) => return Reply::action_not_taken(),
                Err(_) => return Reply::slave_unavailable(),
            },
            _ => return Reply::bad_sequence(),
        };

        let file = match &planned {
            PlannedTransfer::Retr { file } => file.clone(),
            PlannedTransfer::Stor { dir, name } => {
                match ctx.tree.create_file(dir, name, &self.user, &self.group, &slave) {
                    Ok(node) => node,
                    Err(VfsError::AlreadyExists(_)) => return Reply::file_exists(),
                    Err(VfsError::IllegalName(_)) => return Reply::name_not_allowed(),
                    Err(e) => {
                        debug!("cannot create {}: {}", name, e);
                        return Reply::action_not_taken();
                    }
                }
            }
            PlannedTransfer::List { .. } => return Reply::bad_sequence(),
        };
        let path = file.path();

        // set up the data channel for active mode
        if let Some(addr) = st.port_address() {
            let fetched = match slave.issue_connect(addr, st.encrypted, st.client_mode) {
                Ok(ticket) => slave.fetch_transfer(ticket).await,
                Err(e) => Err(e),
            };
            match fetched {
                Ok(t) => st.transfer = Some(t),
                Err(e) => {
                    warn!("{} could not connect to {}: {}", slave.name(), addr, e);
                    slave.mark_unavailable(&e.to_string());
                    if direction == Direction::Upload {
                        ctx.tree.discard(&file);
                    }
                    return Reply::slave_unavailable();
                }
            }
        }
        let Some(transfer) = st.transfer.take() else {
            if direction == Direction::Upload {
                ctx.tree.discard(&file);
            }
            return Reply::bad_sequence();
        };

        let preliminary = Reply::new(
            reply::FILE_STATUS_OK,
            format!(
                "File status okay; about to open data connection {} {}.",
                if direction == Direction::Download { "from" } else { "to" },
                slave.name()
            ),
        );
        if let Err(e) = write_reply(out, &preliminary).await {
            debug!("control channel write failed: {}", e);
        }

        st.active = true;
        let resume = st.resume;
        let mut last = TransferProgress::default();
        let started = match direction {
            Direction::Download => transfer.send_file(&path, resume).await,
            Direction::Upload => transfer.receive_file(&path, resume).await,
        };
        let result = match started {
            Ok(()) => {
                let watch_length = (direction == Direction::Upload).then_some(&file);
                poll_until_finished(&transfer, watch_length, cancel, &mut last).await
            }
            Err(e) => Err(TransferError::from(e)),
        };
        st.active = false;

        match result {
            Ok(()) => self.complete(direction, &file, &slave, &transfer, &last, resume),
            Err(e) => self.fail(direction, &file, &slave, &path, &last, e).await,
        }
    }

    fn complete(
        &self,
        direction: Direction,
        file: &Arc<Node>,
        slave: &Arc<SlaveHandle>,
        transfer: &Transfer,
        status: &TransferProgress,
        resume: u64,
    ) -> Reply {
        let ctx = self.ctx();
        let bytes = status.transferred;
        if direction == Direction::Upload {
            if resume == 0 {
                let _ = file.set_checksum(status.checksum);
            }
            let _ = file.set_length(bytes);
            file.set_last_modified(chrono::Utc::now().timestamp_millis());
            let _ = file.set_xfer_time_ms(status.elapsed_ms);
        }

        let parent = file.parent().map(|p| p.path()).unwrap_or_default();
        match direction {
            Direction::Download => {
                let ratio = ctx.config.credit_loss_ratio;
                if ratio != 0.0 {
                    ctx.accounting
                        .update_credits(&self.user, -((bytes as f64 * ratio) as i64));
                }
                if !self.permitted(Rule::NoStatsDown, &parent) {
                    ctx.accounting.update_downloaded_bytes(&self.user, bytes);
                }
            }
            Direction::Upload => {
                let ratio = ctx.config.credit_check_ratio;
                ctx.accounting
                    .update_credits(&self.user, (bytes as f64 * ratio) as i64);
                if !self.permitted(Rule::NoStatsUp, &parent) {
                    ctx.accounting.update_uploaded_bytes(&self.user, bytes);
                }
            }
        }
        if let Err(e) = ctx.accounting.commit(&self.user) {
            warn!("cannot save user {}: {:#}", self.user, e);
        }

        let mut entry = TransferLogEntry::new(direction, &file.path(), TransferStatus::Completed);
        entry.slave = Some(slave.name().to_string());
        entry.bytes_transferred = bytes;
        entry.checksum = status.checksum;
        entry.xfer_time_ms = status.elapsed_ms;
        self.log_transfer(&mut entry);
        info!(
            "{} {} {} bytes via {} (transfer {})",
            if direction == Direction::Download { "RETR" } else { "STOR" },
            file.path(),
            bytes,
            slave.name(),
            transfer.id()
        );

        let seconds = status.elapsed_ms as f64 / 1000.0;
        let speed = if status.elapsed_ms > 0 {
            bytes * 1000 / status.elapsed_ms
        } else {
            0
        };
        let mut r = Reply::new(
            reply::TRANSFER_COMPLETE,
            format!(
                "Transfer complete, {} bytes in {:.2} seconds ({} bytes/s)",
                bytes, seconds, speed
            ),
        );
        if status.checksum != checksum::UNKNOWN {
            r.add_comment(format!("Checksum: {}", format_checksum(status.checksum)));
        }
        r
    }

    /// Roll back after a failed transfer: a partial upload is deleted from
    /// its slave and dropped from the tree, a download is charged for the
    /// bytes that did go out.
    async fn fail(
        &self,
        direction: Direction,
        file: &Arc<Node>,
        slave: &Arc<SlaveHandle>,
        path: &str,
        status: &TransferProgress,
        err: TransferError,
    ) -> Reply {
        let ctx = self.ctx();
        let offline = matches!(&err, TransferError::Remote(e) if e.is_communication());
        let aborted = matches!(err, TransferError::Aborted);

        let mut r = match direction {
            Direction::Upload => {
                if let Err(e) = slave.remote_delete(path).await {
                    debug!("cannot delete partial {} on {}: {}", path, slave.name(), e);
                }
                ctx.tree.discard(file);
                error!("transfer of {} failed, deleting file: {}", path, err);
                let what = if offline {
                    "Slave went offline during transfer, deleting file"
                } else if aborted {
                    "Transfer aborted, deleting file"
                } else {
                    "Transfer failed, deleting file"
                };
                Reply::new(reply::TRANSFER_ABORTED, what)
            }
            Direction::Download => {
                let ratio = ctx.config.credit_loss_ratio;
                if ratio != 0.0 && status.transferred > 0 {
                    ctx.accounting.update_credits(
                        &self.user,
                        -((status.transferred as f64 * ratio) as i64),
                    );
                    if let Err(e) = ctx.accounting.commit(&self.user) {
                        warn!("cannot save user {}: {:#}", self.user, e);
                    }
                }
                error!("transfer of {} failed: {}", path, err);
                let what = if offline {
                    "Slave went offline during transfer".to_string()
                } else if aborted {
                    "Transfer aborted".to_string()
                } else {
                    err.to_string()
                };
                Reply::new(reply::TRANSFER_ABORTED, what)
            }
        };
        r.add_comment(err.to_string());

        let mut entry = TransferLogEntry::new(
            direction,
            path,
            if aborted {
                TransferStatus::Aborted
            } else {
                TransferStatus::Failed
            },
        );
        entry.slave = Some(slave.name().to_string());
        entry.bytes_transferred = status.transferred;
        entry.error = Some(err.to_string());
        self.log_transfer(&mut entry);
        r
    }

    fn log_transfer(&self, entry: &mut TransferLogEntry) {
        entry.session = Some(self.session_id.clone());
        if let Some(log) = &self.ctx().transfer_log {
            if let Err(e) = log.add_entry(entry) {
                warn!("cannot write transfer log {}: {:#}", log.path().display(), e);
            }
        }
    }
}

/// Poll the slave until the transfer finishes. An upload's file node
/// follows the received length as it grows. `last` holds the most recent
/// status, also when this fails.
async fn poll_until_finished(
    transfer: &Transfer,
    growing: Option<&Arc<Node>>,
    cancel: &mut watch::Receiver<bool>,
    last: &mut TransferProgress,
) -> Result<(), TransferError> {
    let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_POLL_MS));
    let mut cancellable = true;
    loop {
        if *cancel.borrow() {
            if let Err(e) = transfer.abort("aborted by client").await {
                debug!("abort of transfer {} failed: {}", transfer.id(), e);
            }
            return Err(TransferError::Aborted);
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = cancel.changed(), if cancellable => {
                // a dropped sender can no longer cancel
                if changed.is_err() {
                    cancellable = false;
                }
                continue;
            }
        }

        let status = transfer.status().await?;
        if let Some(file) = growing {
            let _ = file.set_length(status.transferred);
        }
        *last = status;
        if last.finished {
            return match &last.error {
                Some(e) => Err(TransferError::Failed(e.clone())),
                None => Ok(()),
            };
        }
    }
}

pub async fn write_reply<W>(out: &mut W, r: &Reply) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    out.write_all(r.to_wire().as_bytes()).await?;
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn controller(tls: bool) -> DataConnectionController {
        let mut ctx = Context::new(Config::default());
        if tls {
            let dir = tempfile::tempdir().unwrap();
            let cfg = crate::tls::load_or_generate_server_config(None, None, dir.path()).unwrap();
            ctx.tls = Some(crate::tls::acceptor(cfg));
        }
        DataConnectionController::new(
            Arc::new(ctx),
            "alice",
            "users",
            "203.0.113.7:50000".parse().unwrap(),
            "127.0.0.1:2121".parse().unwrap(),
        )
    }

    #[test]
    fn reply_wire_format_puts_comments_first() {
        let r = Reply::new(200, "Command okay").with_comment("one").with_comment("two");
        assert_eq!(r.to_wire(), "200-one\r\n200-two\r\n200 Command okay\r\n");
    }

    #[test]
    fn simple_parameter_commands() {
        let mut c = controller(false);
        assert_eq!(c.pbsz(Some("0")).code, 200);
        assert_eq!(c.pbsz(Some("1")).code, 501);
        assert_eq!(c.pbsz(None).code, 501);
        assert_eq!(c.mode(Some("S")).code, 200);
        assert_eq!(c.mode(Some("B")).code, 504);
        assert_eq!(c.mode(None).code, 501);
        assert_eq!(c.stru(Some("F")).code, 200);
        assert_eq!(c.stru(Some("R")).code, 504);
        assert_eq!(c.type_(Some("I")).code, 200);
        assert_eq!(c.type_(Some("E")).code, 504);
        assert_eq!(c.rest(Some("1024")).code, 350);
        assert_eq!(c.state().resume(), 1024);
        assert_eq!(c.rest(Some("-1")).code, 501);
        assert_eq!(c.state().resume(), 0);
    }

    #[test]
    fn tls_commands_without_tls() {
        let mut c = controller(false);
        assert_eq!(c.auth(Some("TLS")).code, 400);
        assert_eq!(c.prot(Some("P")).message, "TLS not configured");
        assert_eq!(c.sscn(Some("ON")).code, 500);
    }

    #[test]
    fn tls_commands_on_secure_channel() {
        let mut c = controller(true);
        assert_eq!(c.auth(Some("TLS")).code, 234);
        assert_eq!(c.auth(Some("XYZ")).code, 504);
        assert_eq!(c.prot(Some("P")).message, "You are not on a secure channel");
        c.set_secure_control(true);
        assert_eq!(c.sscn(Some("ON")).message, "SSCN only works for encrypted transfers");
        assert_eq!(c.prot(Some("P")).code, 200);
        assert!(c.state().encrypted());
        assert_eq!(c.prot(Some("PP")).code, 501);
        let r = c.sscn(Some("ON"));
        assert_eq!((r.code, r.message.as_str()), (220, "SSCN:CLIENT METHOD"));
        assert_eq!(c.sscn(Some("OFF")).message, "SSCN:SERVER METHOD");
        assert_eq!(c.prot(None).code, 200);
        assert!(!c.state().encrypted());
    }

    #[test]
    fn port_rejects_private_address_from_public_peer() {
        let mut c = controller(false);
        let r = c.port(Some("192,168,1,2,4,1"));
        assert_eq!(r.code, 501);
        assert_eq!(r.comments[0], "==YOU'RE BEHIND A NAT ROUTER==");
        assert_eq!(c.state().mode(), None);

        assert_eq!(c.port(Some("1,2,3,4,5")).code, 501);
        assert_eq!(c.port(Some("1,2,3,4,5,300")).code, 501);
    }

    #[test]
    fn port_records_address_and_comments() {
        let mut c = controller(false);
        let r = c.port(Some("127,0,0,1,4,1"));
        assert_eq!(r.code, 200);
        assert!(r.comments.iter().any(|l| l.contains("local addresses")));
        assert!(r.comments.iter().any(|l| l.starts_with("FXP allowed")));
        assert_eq!(c.state().port_address(), Some("127.0.0.1:1025".parse().unwrap()));
    }

    #[tokio::test]
    async fn pasv_needs_pret() {
        let mut c = controller(false);
        let r = c.pasv(false).await;
        assert_eq!(r.code, 500);
        assert!(r.message.contains("PRET"));
    }

    #[tokio::test]
    async fn pret_list_then_pasv_opens_master_socket() {
        let mut c = controller(false);
        let root = c.env.ctx.tree.root().clone();
        assert_eq!(c.pret(&root, Some("LIST")).code, 200);
        let r = c.pasv(false).await;
        assert_eq!(r.code, 227);
        assert!(r.message.starts_with("Entering Passive Mode (127,0,0,1,"));
        assert_eq!(r.comments, vec!["Using master for upcoming transfer".to_string()]);
        assert!(c.state().has_local_listener());
        c.reset();
        assert!(!c.state().has_local_listener());
    }

    #[test]
    fn pret_validates_targets() {
        let mut c = controller(false);
        let root = c.env.ctx.tree.root().clone();
        c.env.ctx.tree.create_directory(&root, "dir", "u", "g").unwrap();
        assert_eq!(c.pret(&root, Some("RETR missing")).code, 550);
        assert_eq!(c.pret(&root, Some("RETR dir")).message, "Requested target is not a file");
        assert_eq!(c.pret(&root, Some("STOR dir")).code, 553);
        assert_eq!(c.pret(&root, Some("STOR a*b")).code, 553);
        assert_eq!(c.pret(&root, Some("STOR nodir/f")).code, 550);
        assert_eq!(c.pret(&root, Some("MLSD")).code, 504);
        assert_eq!(c.pret(&root, Some("STOR dir/new")).code, 200);
        assert!(c.state().pret().is_some());
    }
}
