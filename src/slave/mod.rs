//! Slaves: the master-side handle and registry, selection, the RPC link,
//! and the slave daemon's own server and data channels

pub mod data;
pub mod handle;
pub mod manager;
pub mod net;
pub mod selection;
pub mod server;
pub mod transport;

pub use handle::{SlaveHandle, Transfer};
pub use manager::SlaveManager;
pub use selection::{SelectionContext, SlaveSelector};
pub use transport::{ConnectInfo, SlaveTransport, TransferId, TransferProgress};
