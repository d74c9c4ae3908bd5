//! Data-connection state of one client session

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use super::Direction;
use crate::slave::{SlaveHandle, Transfer};
use crate::vfs::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    /// Active: the data side connects to the client at this address
    Port(SocketAddr),
    /// Passive: the data side listens, the client connects
    Pasv,
}

/// What a PRET announced
#[derive(Debug, Clone)]
pub enum PlannedTransfer {
    /// LIST or NLST, served by the master itself
    List { command: String },
    Retr { file: Arc<Node> },
    /// Upload of `name` into `dir`; the file does not exist yet
    Stor { dir: Arc<Node>, name: String },
}

impl PlannedTransfer {
    pub fn command(&self) -> &str {
        match self {
            PlannedTransfer::List { command } => command,
            PlannedTransfer::Retr { .. } => "RETR",
            PlannedTransfer::Stor { .. } => "STOR",
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            PlannedTransfer::List { .. } => None,
            PlannedTransfer::Retr { .. } => Some(Direction::Download),
            PlannedTransfer::Stor { .. } => Some(Direction::Upload),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, PlannedTransfer::List { .. })
    }
}

/// Where a session stands between PRET and the end of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PretPending,
    ModeChosen(DataMode),
    SlaveBound,
    TransferActive,
}

/// Per-session transfer state.
///
/// PROT, SSCN and TYPE settings survive `reset`; everything describing the
/// next transfer does not.
#[derive(Debug)]
pub struct TransferState {
    pub(crate) pret: Option<PlannedTransfer>,
    pub(crate) mode: Option<DataMode>,
    pub(crate) slave: Option<Arc<SlaveHandle>>,
    pub(crate) transfer: Option<Transfer>,
    pub(crate) local_listener: Option<TcpListener>,
    pub(crate) resume: u64,
    pub(crate) active: bool,
    pub(crate) encrypted: bool,
    pub(crate) client_mode: bool,
    pub(crate) type_code: char,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            pret: None,
            mode: None,
            slave: None,
            transfer: None,
            local_listener: None,
            resume: 0,
            active: false,
            encrypted: false,
            client_mode: false,
            type_code: 'A',
        }
    }
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        if self.active {
            return Phase::TransferActive;
        }
        match (self.mode, &self.slave, &self.pret) {
            (Some(_), Some(_), _) => Phase::SlaveBound,
            (Some(mode), None, _) => Phase::ModeChosen(mode),
            (None, _, Some(_)) => Phase::PretPending,
            (None, _, None) => Phase::Idle,
        }
    }

    /// Back to `Idle`. Drops any passive listener and pending slave
    /// transfer.
    pub fn reset(&mut self) {
        self.pret = None;
        self.mode = None;
        self.slave = None;
        self.transfer = None;
        self.local_listener = None;
        self.resume = 0;
        self.active = false;
    }

    pub fn pret(&self) -> Option<&PlannedTransfer> {
        self.pret.as_ref()
    }

    pub fn mode(&self) -> Option<DataMode> {
        self.mode
    }

    pub fn bound_slave(&self) -> Option<&Arc<SlaveHandle>> {
        self.slave.as_ref()
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        self.transfer.as_ref()
    }

    pub fn has_local_listener(&self) -> bool {
        self.local_listener.is_some()
    }

    pub fn resume(&self) -> u64 {
        self.resume
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn client_mode(&self) -> bool {
        self.client_mode
    }

    pub fn type_code(&self) -> char {
        self.type_code
    }

    pub fn port_address(&self) -> Option<SocketAddr> {
        match self.mode {
            Some(DataMode::Port(addr)) => Some(addr),
            _ => None,
        }
    }

    /// TYPE A and I are the only representation types served
    pub fn set_type(&mut self, code: char) -> bool {
        match code.to_ascii_uppercase() {
            c @ ('A' | 'I') => {
                self.type_code = c;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_follow_the_bound_fields() {
        let mut st = TransferState::new();
        assert_eq!(st.phase(), Phase::Idle);
        st.pret = Some(PlannedTransfer::List {
            command: "LIST".into(),
        });
        assert_eq!(st.phase(), Phase::PretPending);
        st.mode = Some(DataMode::Pasv);
        assert_eq!(st.phase(), Phase::ModeChosen(DataMode::Pasv));
        st.slave = Some(SlaveHandle::new("s1"));
        assert_eq!(st.phase(), Phase::SlaveBound);
        st.active = true;
        assert_eq!(st.phase(), Phase::TransferActive);
    }

    #[test]
    fn reset_keeps_session_settings() {
        let mut st = TransferState::new();
        st.encrypted = true;
        st.client_mode = true;
        assert!(st.set_type('i'));
        st.resume = 10;
        st.mode = Some(DataMode::Port("127.0.0.1:2000".parse().unwrap()));
        st.reset();
        assert_eq!(st.phase(), Phase::Idle);
        assert_eq!(st.resume(), 0);
        assert!(st.encrypted());
        assert!(st.client_mode());
        assert_eq!(st.type_code(), 'I');
        assert!(!st.set_type('E'));
    }
}
