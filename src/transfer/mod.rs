//! Per-session data-connection state and transfer execution

pub mod account;
pub mod handler;
pub mod state;

use serde::{Deserialize, Serialize};

pub use account::{Accounting, AllowAll, MemoryAccounting, Permissions, Rule, UserStats};
pub use handler::{DataConnectionController, Reply};
pub use state::{DataMode, Phase, PlannedTransfer, TransferState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Client to slave (STOR)
    Upload,
    /// Slave to client (RETR)
    Download,
}
