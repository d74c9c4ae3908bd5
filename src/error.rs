//! Error kinds shared by the tree, the slave link and the transfer engine

use thiserror::Error;

/// Failures reported by a slave (or by the link to it)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Application-level: the slave has no such file
    #[error("not found on slave: {0}")]
    NotFound(String),
    /// Application-level I/O failure on the slave; the link is still healthy
    #[error("slave I/O error: {0}")]
    Io(String),
    /// The link itself failed; the slave must be considered offline
    #[error("slave communication error: {0}")]
    Communication(String),
}

impl RemoteError {
    pub fn is_communication(&self) -> bool {
        matches!(self, RemoteError::Communication(_))
    }
}

/// Failures of directory tree operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VfsError {
    #[error("{0}: no such file or directory")]
    NotFound(String),
    #[error("{0}: already exists")]
    AlreadyExists(String),
    #[error("{0}: not a directory")]
    NotADirectory(String),
    #[error("{0}: not a file")]
    NotAFile(String),
    #[error("{0}: no available slave")]
    NoAvailableSlave(String),
    /// File/directory kind mismatch between the tree and a slave listing
    #[error("structural conflict: {0}")]
    StructuralConflict(String),
    #[error("illegal file name: {0:?}")]
    IllegalName(String),
    #[error("{0}: file has offline slaves")]
    OfflineSlaves(String),
    /// The name is held by a deleted node whose copies are not all gone yet
    #[error("{0}: deletion still pending on an offline slave")]
    PendingDeletion(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl VfsError {
    /// Errors the caller may retry after selecting another slave
    pub fn is_retryable(&self) -> bool {
        match self {
            VfsError::NoAvailableSlave(_) => true,
            VfsError::Remote(e) => e.is_communication(),
            _ => false,
        }
    }
}

/// Failures of a running data transfer
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("transfer aborted")]
    Aborted,
    #[error("transfer failed: {0}")]
    Failed(String),
}

pub type VfsResult<T> = std::result::Result<T, VfsError>;
