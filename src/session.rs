//! Client control connections on the master
//!
//! One task per client. Commands are read line by line; data-connection
//! commands go to the session's `DataConnectionController`, namespace
//! commands straight to the shared `DirectoryTree`.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::TimeZone;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::error::VfsError;
use crate::log::TransferLog;
use crate::protocol::{reply, MAX_COMMAND_LINE};
use crate::protocol_core::split_path;
use crate::slave::data::DataStream;
use crate::slave::{SlaveManager, SlaveSelector};
use crate::transfer::handler::write_reply;
use crate::transfer::{Accounting, AllowAll, DataConnectionController, MemoryAccounting, Permissions, Reply};
use crate::vfs::{DirectoryTree, Node};

const DEFAULT_GROUP: &str = "users";

/// Everything a session or slave task shares, built once at startup
pub struct Context {
    pub config: Config,
    pub tree: DirectoryTree,
    pub slaves: SlaveManager,
    pub selector: SlaveSelector,
    pub tls: Option<TlsAcceptor>,
    pub transfer_log: Option<TransferLog>,
    pub accounting: Arc<dyn Accounting>,
    pub permissions: Arc<dyn Permissions>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        let selector = SlaveSelector::from_config(&config.slave_selection);
        let transfer_log = config.transfer_log.as_deref().map(TransferLog::new);
        Self {
            config,
            tree: DirectoryTree::new(),
            slaves: SlaveManager::new(),
            selector,
            tls: None,
            transfer_log,
            accounting: Arc::new(MemoryAccounting::new()),
            permissions: Arc::new(AllowAll),
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }
}

enum Outcome {
    Closed,
    StartTls,
}

pub struct Session {
    ctx: Arc<Context>,
    cwd: Arc<Node>,
    data: DataConnectionController,
    pending_user: Option<String>,
    logged_in: bool,
    rename_from: Option<Arc<Node>>,
}

/// Accept client control connections forever
pub async fn serve_clients(ctx: Arc<Context>, listener: TcpListener) -> Result<()> {
    info!("accepting clients on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("client accept failed: {}", e);
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_session(ctx, stream).await {
                debug!("session with {} ended: {:#}", peer, e);
            }
        });
    }
}

/// Serve one control connection until QUIT or disconnect
pub async fn run_session(ctx: Arc<Context>, stream: TcpStream) -> Result<()> {
    let peer = stream.peer_addr().context("client peer address")?;
    let local = stream.local_addr().context("control local address")?;
    let _ = stream.set_nodelay(true);
    let mut session = Session::new(ctx.clone(), peer, local);
    info!("[{}] client {} connected", session.id(), peer);

    let mut control: Box<dyn DataStream> = Box::new(stream);
    let mut greeting = Some(Reply::new(reply::SERVICE_READY, "dftpd ready"));
    loop {
        let (r, mut w) = tokio::io::split(control);
        if let Some(g) = greeting.take() {
            write_reply(&mut w, &g).await?;
        }
        let mut lines = ControlLines::new(r);
        match session.serve(&mut lines, &mut w).await? {
            Outcome::Closed => {
                info!("[{}] client {} disconnected", session.id(), peer);
                return Ok(());
            }
            Outcome::StartTls => {
                let (r, pipelined) = lines.into_inner();
                if pipelined {
                    // plaintext queued behind AUTH would be read as if it came over TLS
                    bail!("client sent commands before the TLS handshake");
                }
                let plain = r.unsplit(w);
                let acceptor = ctx
                    .tls
                    .clone()
                    .ok_or_else(|| anyhow!("TLS not configured"))?;
                let tls = acceptor.accept(plain).await.context("control TLS handshake")?;
                session.data.set_secure_control(true);
                debug!("[{}] control channel secured", session.id());
                control = Box::new(tls);
            }
        }
    }
}

enum ControlLine {
    Command(String),
    TooLong,
    Closed,
}

/// Reads control-channel lines of at most `MAX_COMMAND_LINE` bytes.
/// `next` is cancel-safe: a partly received line stays buffered.
struct ControlLines<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> ControlLines<R> {
    fn new(r: R) -> Self {
        Self {
            inner: BufReader::new(r),
            buf: Vec::new(),
            discarding: false,
        }
    }

    async fn next(&mut self) -> std::io::Result<ControlLine> {
        if self.discarding {
            self.skip_line().await?;
            self.discarding = false;
            return Ok(ControlLine::TooLong);
        }
        let room = MAX_COMMAND_LINE - self.buf.len();
        let n = (&mut self.inner)
            .take(room as u64)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if self.buf.last() == Some(&b'\n') || (n < room && !self.buf.is_empty()) {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            return Ok(ControlLine::Command(line));
        }
        if n < room {
            return Ok(ControlLine::Closed);
        }
        self.buf.clear();
        self.discarding = true;
        self.skip_line().await?;
        self.discarding = false;
        Ok(ControlLine::TooLong)
    }

    /// Drop input up to and including the next newline
    async fn skip_line(&mut self) -> std::io::Result<()> {
        loop {
            let chunk = self.inner.fill_buf().await?;
            if chunk.is_empty() {
                return Ok(());
            }
            match chunk.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    self.inner.consume(i + 1);
                    return Ok(());
                }
                None => {
                    let len = chunk.len();
                    self.inner.consume(len);
                }
            }
        }
    }

    /// The reader, and whether input is already queued behind the last line
    fn into_inner(self) -> (R, bool) {
        let queued = !self.buf.is_empty() || !self.inner.buffer().is_empty();
        (self.inner.into_inner(), queued)
    }
}

fn parse_command(line: &str) -> (String, Option<String>) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((cmd, arg)) => {
            let arg = arg.trim();
            (
                cmd.to_ascii_uppercase(),
                (!arg.is_empty()).then(|| arg.to_string()),
            )
        }
        None => (line.trim().to_ascii_uppercase(), None),
    }
}

impl Session {
    pub fn new(ctx: Arc<Context>, peer: std::net::SocketAddr, local: std::net::SocketAddr) -> Self {
        let cwd = ctx.tree.root().clone();
        let data = DataConnectionController::new(ctx.clone(), "", DEFAULT_GROUP, peer, local);
        Self {
            ctx,
            cwd,
            data,
            pending_user: None,
            logged_in: false,
            rename_from: None,
        }
    }

    pub fn id(&self) -> &str {
        self.data.session_id()
    }

    async fn serve<R, W>(&mut self, lines: &mut ControlLines<R>, out: &mut W) -> Result<Outcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let line = match lines.next().await? {
                ControlLine::Command(line) => line,
                ControlLine::TooLong => {
                    let r = Reply::new(reply::SYNTAX_ERROR_COMMAND, "Command line too long");
                    write_reply(out, &r).await?;
                    continue;
                }
                ControlLine::Closed => return Ok(Outcome::Closed),
            };
            let (cmd, arg) = parse_command(&line);
            if cmd.is_empty() {
                continue;
            }
            if cmd == "PASS" {
                debug!("[{}] > PASS ****", self.id());
            } else {
                debug!("[{}] > {}", self.id(), line.trim_end());
            }
            let arg = arg.as_deref();

            if !self.logged_in && !matches!(
                cmd.as_str(),
                "USER" | "PASS" | "AUTH" | "PBSZ" | "PROT" | "FEAT" | "SYST" | "NOOP" | "QUIT"
            ) {
                write_reply(out, &Reply::new(reply::ACCESS_DENIED, "Not logged in.")).await?;
                continue;
            }

            match cmd.as_str() {
                "QUIT" => {
                    write_reply(out, &Reply::new(reply::CLOSING, "Goodbye")).await?;
                    return Ok(Outcome::Closed);
                }
                "AUTH" => {
                    let r = self.data.auth(arg);
                    write_reply(out, &r).await?;
                    if r.code == reply::AUTH_OK {
                        return Ok(Outcome::StartTls);
                    }
                }
                "FEAT" => {
                    out.write_all(
                        b"211-Extensions supported:\r\n PRET\r\n AUTH TLS\r\n CPSV\r\n SSCN\r\n PBSZ\r\n PROT\r\n SIZE\r\n REST STREAM\r\n211 End\r\n",
                    )
                    .await?;
                    out.flush().await?;
                }
                "RETR" | "STOR" | "APPE" | "STOU" => {
                    if self.transfer(&cmd, arg, lines, out).await? {
                        return Ok(Outcome::Closed);
                    }
                }
                "LIST" | "NLST" => {
                    self.list(&cmd, arg, out).await?;
                }
                _ => {
                    let r = self.dispatch(&cmd, arg).await;
                    write_reply(out, &r).await?;
                }
            }
        }
    }

    /// Run a data transfer while still reading the control channel, so that
    /// ABOR or a disconnect cancels it. Returns true if the client is gone.
    async fn transfer<R, W>(
        &mut self,
        cmd: &str,
        arg: Option<&str>,
        lines: &mut ControlLines<R>,
        out: &mut W,
    ) -> Result<bool>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (cancel, cancelled) = watch::channel(false);
        let cwd = self.cwd.clone();
        let mut aborted = false;
        let mut closed = false;
        let reply = {
            let run = self.data.transfer(cmd, &cwd, arg, &mut *out, cancelled);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    r = &mut run => break r,
                    line = lines.next(), if !closed => match line {
                        Ok(ControlLine::Command(l)) if parse_command(&l).0 == "ABOR" => {
                            aborted = true;
                            let _ = cancel.send(true);
                        }
                        Ok(ControlLine::Command(l)) => debug!("ignoring {:?} during transfer", l.trim_end()),
                        Ok(ControlLine::TooLong) => debug!("ignoring overlong line during transfer"),
                        Ok(ControlLine::Closed) | Err(_) => {
                            closed = true;
                            let _ = cancel.send(true);
                        }
                    }
                }
            }
        };
        if closed {
            return Ok(true);
        }
        write_reply(out, &reply).await?;
        if aborted {
            write_reply(out, &Reply::new(reply::TRANSFER_COMPLETE, "ABOR command successful")).await?;
        }
        Ok(false)
    }

    /// LIST/NLST over a data connection the master opens itself
    async fn list<W>(&mut self, cmd: &str, arg: Option<&str>, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        // options such as -la are accepted and ignored
        let target = arg
            .map(|a| {
                a.split_whitespace()
                    .filter(|t| !t.starts_with('-'))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|t| !t.is_empty());
        let node = match &target {
            Some(t) => match self.ctx.tree.lookup_file_from(&self.cwd, t) {
                Ok(n) => n,
                Err(_) => {
                    self.data.reset();
                    return Ok(write_reply(out, &Reply::action_not_taken()).await?);
                }
            },
            None => self.cwd.clone(),
        };
        let entries = if node.is_directory() {
            self.ctx.tree.list_children(&node).unwrap_or_default()
        } else {
            vec![node.clone()]
        };

        write_reply(
            out,
            &Reply::new(
                reply::FILE_STATUS_OK,
                "File status okay; about to open data connection.",
            ),
        )
        .await?;
        let mut data = match self.data.open_local_data().await {
            Ok(d) => d,
            Err(r) => {
                self.data.reset();
                return Ok(write_reply(out, &r).await?);
            }
        };
        let mut body = String::new();
        for e in &entries {
            if cmd == "NLST" {
                body.push_str(&e.name());
            } else {
                body.push_str(&list_line(e));
            }
            body.push_str("\r\n");
        }
        let sent = async {
            data.write_all(body.as_bytes()).await?;
            data.shutdown().await
        }
        .await;
        self.data.reset();
        match sent {
            Ok(()) => write_reply(out, &Reply::new(reply::TRANSFER_COMPLETE, "Closing data connection")).await?,
            Err(e) => {
                write_reply(
                    out,
                    &Reply::new(reply::TRANSFER_ABORTED, "Connection closed; transfer aborted.")
                        .with_comment(e.to_string()),
                )
                .await?
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, cmd: &str, arg: Option<&str>) -> Reply {
        let tree = &self.ctx.tree;
        match cmd {
            "USER" => match arg {
                Some(user) => {
                    self.pending_user = Some(user.to_string());
                    self.logged_in = false;
                    Reply::new(reply::NEED_PASSWORD, format!("Password required for {}", user))
                }
                None => Reply::syntax_error(),
            },
            // passwords are checked by the user database in front of us
            "PASS" => match self.pending_user.take() {
                Some(user) => {
                    self.data.set_user(&user, DEFAULT_GROUP);
                    self.logged_in = true;
                    info!("[{}] user {} logged in", self.id(), user);
                    Reply::new(reply::LOGGED_IN, format!("User {} logged in.", user))
                }
                None => Reply::bad_sequence(),
            },
            "SYST" => Reply::new(reply::SYSTEM_TYPE, "UNIX Type: L8"),
            "NOOP" => Reply::ok(),
            "PWD" | "XPWD" => Reply::new(
                reply::PATH_CREATED,
                format!("\"{}\" is current directory.", self.cwd.path()),
            ),
            "CWD" | "CDUP" => {
                let target = if cmd == "CDUP" { ".." } else { arg.unwrap_or("/") };
                match tree.lookup_file_from(&self.cwd, target) {
                    Ok(dir) if dir.is_directory() => {
                        self.cwd = dir;
                        Reply::new(
                            reply::FILE_ACTION_OK,
                            format!("Directory changed to {}", self.cwd.path()),
                        )
                    }
                    _ => Reply::action_not_taken(),
                }
            }
            "MKD" | "XMKD" => {
                let Some(arg) = arg else {
                    return Reply::syntax_error();
                };
                let resolved = tree.resolve_from(&self.cwd, arg);
                let Some(name) = resolved.remainder else {
                    return Reply::new(reply::ACTION_NOT_TAKEN, format!("{}: already exists", arg));
                };
                if name.contains('/') {
                    return Reply::action_not_taken();
                }
                match tree.create_directory(&resolved.node, &name, self.data.user(), DEFAULT_GROUP) {
                    Ok(dir) => Reply::new(reply::PATH_CREATED, format!("\"{}\" created.", dir.path())),
                    Err(VfsError::IllegalName(_)) => Reply::name_not_allowed(),
                    Err(e) => Reply::new(reply::ACTION_NOT_TAKEN, e.to_string()),
                }
            }
            "DELE" | "RMD" | "XRMD" => {
                let Some(arg) = arg else {
                    return Reply::syntax_error();
                };
                let node = match tree.lookup_file_from(&self.cwd, arg) {
                    Ok(n) => n,
                    Err(_) => return Reply::action_not_taken(),
                };
                if cmd == "DELE" && !node.is_file() {
                    return Reply::new(reply::ACTION_NOT_TAKEN, format!("{}: not a plain file", arg));
                }
                if cmd != "DELE" {
                    if !node.is_directory() || node.is_root() {
                        return Reply::new(reply::ACTION_NOT_TAKEN, format!("{}: not a directory", arg));
                    }
                    if !tree.list_children(&node).unwrap_or_default().is_empty() {
                        return Reply::new(reply::ACTION_NOT_TAKEN, format!("{}: directory not empty", arg));
                    }
                }
                match tree.delete(&node).await {
                    Ok(()) => Reply::new(reply::FILE_ACTION_OK, format!("{} command successful", cmd)),
                    Err(e) => Reply::new(reply::ACTION_NOT_TAKEN, e.to_string()),
                }
            }
            "RNFR" => {
                let Some(arg) = arg else {
                    return Reply::syntax_error();
                };
                match tree.lookup_file_from(&self.cwd, arg) {
                    Ok(node) if !node.is_root() => {
                        self.rename_from = Some(node);
                        Reply::new(
                            reply::PENDING_FURTHER_INFORMATION,
                            "File exists, ready for destination name",
                        )
                    }
                    _ => Reply::action_not_taken(),
                }
            }
            "RNTO" => {
                let Some(from) = self.rename_from.take() else {
                    return Reply::bad_sequence();
                };
                let Some(arg) = arg else {
                    return Reply::syntax_error();
                };
                let target = tree.lookup_path(&self.cwd, arg);
                let Some((dir, name)) = split_path(&target) else {
                    return Reply::name_not_allowed();
                };
                match tree.rename(&from, dir, name).await {
                    Ok(()) => Reply::new(reply::FILE_ACTION_OK, "RNTO command successful"),
                    Err(VfsError::AlreadyExists(_)) => Reply::file_exists(),
                    Err(VfsError::IllegalName(_)) => Reply::name_not_allowed(),
                    Err(e) => Reply::new(reply::ACTION_NOT_TAKEN, e.to_string()),
                }
            }
            "SIZE" => {
                let Some(arg) = arg else {
                    return Reply::syntax_error();
                };
                match tree.lookup_file_from(&self.cwd, arg) {
                    Ok(n) if n.is_file() => Reply::new(reply::FILE_STATUS, n.length().to_string()),
                    _ => Reply::action_not_taken(),
                }
            }
            "ABOR" => {
                self.data.reset();
                Reply::new(reply::TRANSFER_COMPLETE, "ABOR command successful")
            }
            "REST" => self.data.rest(arg),
            "TYPE" => self.data.type_(arg),
            "MODE" => self.data.mode(arg),
            "STRU" => self.data.stru(arg),
            "PBSZ" => self.data.pbsz(arg),
            "PROT" => self.data.prot(arg),
            "SSCN" => self.data.sscn(arg),
            "PORT" => self.data.port(arg),
            "PASV" => self.data.pasv(false).await,
            "CPSV" => self.data.pasv(true).await,
            "PRET" => {
                let cwd = self.cwd.clone();
                self.data.pret(&cwd, arg)
            }
            _ => Reply::new(reply::SYNTAX_ERROR_COMMAND, "Command not understood"),
        }
    }
}

/// `ls -l` style line; files without an online copy are flagged
fn list_line(node: &Node) -> String {
    let meta = node.metadata();
    let when = chrono::Utc
        .timestamp_millis_opt(meta.last_modified)
        .single()
        .map(|t| t.format("%b %d %H:%M").to_string())
        .unwrap_or_else(|| "Jan 01 00:00".to_string());
    let owner = if meta.owner.is_empty() { "drftpd" } else { meta.owner.as_str() };
    let group = if meta.group.is_empty() { "drftpd" } else { meta.group.as_str() };
    if node.is_directory() {
        format!(
            "drwxr-xr-x {:>3} {:<8} {:<8} {:>12} {} {}",
            node.child_count(),
            owner,
            group,
            0,
            when,
            node.name()
        )
    } else {
        let name = if node.is_available() {
            node.name()
        } else {
            format!("{}-OFFLINE", node.name())
        };
        format!(
            "-rw-r--r-- {:>3} {:<8} {:<8} {:>12} {} {}",
            node.slave_count(),
            owner,
            group,
            node.length(),
            when,
            name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_split_and_upper_cased() {
        assert_eq!(parse_command("retr file name\r\n"), ("RETR".into(), Some("file name".into())));
        assert_eq!(parse_command("PASV"), ("PASV".into(), None));
        assert_eq!(parse_command("CWD  "), ("CWD".into(), None));
    }

    #[test]
    fn list_line_flags_offline_files() {
        let ctx = Context::new(Config::default());
        let slave = crate::slave::SlaveHandle::new("s1");
        let f = ctx
            .tree
            .create_file(ctx.tree.root(), "f", "alice", "users", &slave)
            .unwrap();
        let line = list_line(&f);
        assert!(line.starts_with("-rw-r--r--"));
        assert!(line.ends_with(" f-OFFLINE"));
        slave.force_available();
        assert!(list_line(&f).ends_with(" f"));
    }

    async fn ask<W: AsyncWrite + Unpin>(w: &mut W, cmd: &str) {
        w.write_all(format!("{}\r\n", cmd).as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn control_lines_are_bounded() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut lines = ControlLines::new(server);
        let mut input = vec![b'A'; MAX_COMMAND_LINE + 100];
        input.extend_from_slice(b"\r\nNOOP\r\nQUIT");
        client.write_all(&input).await.unwrap();
        drop(client);

        assert!(matches!(lines.next().await.unwrap(), ControlLine::TooLong));
        assert!(matches!(lines.next().await.unwrap(), ControlLine::Command(l) if l == "NOOP\r\n"));
        // a last line without newline still counts
        assert!(matches!(lines.next().await.unwrap(), ControlLine::Command(l) if l == "QUIT"));
        assert!(matches!(lines.next().await.unwrap(), ControlLine::Closed));
    }

    #[tokio::test]
    async fn input_behind_auth_is_reported() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut lines = ControlLines::new(server);
        client.write_all(b"AUTH TLS\r\nUSER mallory\r\n").await.unwrap();
        assert!(matches!(lines.next().await.unwrap(), ControlLine::Command(l) if l == "AUTH TLS\r\n"));
        assert!(lines.into_inner().1);

        let (mut client, server) = tokio::io::duplex(1024);
        let mut lines = ControlLines::new(server);
        client.write_all(b"AUTH TLS\r\n").await.unwrap();
        lines.next().await.unwrap();
        assert!(!lines.into_inner().1);
    }

    #[tokio::test]
    async fn session_speaks_ftp_over_tcp() {
        let ctx = Arc::new(Context::new(Config::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_clients(ctx.clone(), listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut lines = BufReader::new(r).lines();
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("220 "));
        ask(&mut w, "SYST").await;
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "215 UNIX Type: L8");
        ask(&mut w, "PWD").await;
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "530 Not logged in.");
        ask(&mut w, "USER alice").await;
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("331 "));
        ask(&mut w, "PASS secret").await;
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("230 "));
        ask(&mut w, "MKD section").await;
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "257 \"/section\" created.");
        ask(&mut w, "CWD section").await;
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("250 "));
        ask(&mut w, "PWD").await;
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "257 \"/section\" is current directory.");
        ask(&mut w, "PASV").await;
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("500 You need to use a client supporting PRET"));
        ask(&mut w, "AUTH TLS").await;
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "400 TLS not configured");
        ask(&mut w, "QUIT").await;
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("221 "));
        assert!(ctx.tree.lookup_file("/section").is_ok());
    }
}
