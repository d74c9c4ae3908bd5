//! dftpd library
//!
//! A distributed FTP daemon: one master serving a merged directory tree,
//! many slaves holding the file contents.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod listing;
pub mod log;
pub mod protocol;
pub mod protocol_core;
pub mod reconcile;
pub mod session;
pub mod slave;
pub mod tls;
pub mod transfer;
pub mod vfs;

pub use config::Config;
pub use error::{RemoteError, TransferError, VfsError, VfsResult};
pub use reconcile::ReconciliationDriver;
pub use session::Context;
pub use vfs::DirectoryTree;
