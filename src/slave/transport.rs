//! The RPC boundary between the master and one slave
//!
//! `SlaveTransport` is what a `SlaveHandle` talks through. The production
//! implementation is the framed TCP client in `slave::net`; tests script
//! their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::RemoteError;
use crate::listing::ListingEntry;

/// Slave-assigned id of one data-channel transfer
pub type TransferId = u64;

/// Result of a listen/connect request: the transfer the slave set up and the
/// address the data channel uses (the slave's listening address for passive
/// transfers, the client's address for active ones).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub transfer: TransferId,
    pub addr: SocketAddr,
}

/// Progress of a data-channel transfer as reported by its slave
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub transferred: u64,
    /// Running checksum of the bytes moved so far; final once `finished`
    pub checksum: u64,
    pub elapsed_ms: u64,
    pub finished: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait SlaveTransport: Send + Sync {
    async fn delete(&self, path: &str) -> Result<(), RemoteError>;

    async fn rename(&self, from: &str, to_dir: &str, to_name: &str) -> Result<(), RemoteError>;

    async fn checksum(&self, path: &str) -> Result<u64, RemoteError>;

    /// Listing of the directory at virtual `path`; subdirectories come
    /// back empty unless `recursive`
    async fn listing(&self, path: &str, recursive: bool) -> Result<ListingEntry, RemoteError>;

    /// Open a passive data socket on the slave
    async fn listen(&self, encrypted: bool, client_mode: bool) -> Result<ConnectInfo, RemoteError>;

    /// Have the slave connect out to a client's active data socket
    async fn connect(
        &self,
        addr: SocketAddr,
        encrypted: bool,
        client_mode: bool,
    ) -> Result<ConnectInfo, RemoteError>;

    /// Start sending `path` from `offset` over the transfer's data channel
    async fn send_file(&self, id: TransferId, path: &str, offset: u64) -> Result<(), RemoteError>;

    /// Start receiving into `path` from `offset` over the data channel
    async fn receive_file(&self, id: TransferId, path: &str, offset: u64) -> Result<(), RemoteError>;

    async fn status(&self, id: TransferId) -> Result<TransferProgress, RemoteError>;

    async fn abort(&self, id: TransferId, reason: &str) -> Result<(), RemoteError>;
}

/// One operation on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SlaveOp {
    Delete { path: String },
    Rename { from: String, to_dir: String, to_name: String },
    Checksum { path: String },
    Listing { path: String, recursive: bool },
    Listen { encrypted: bool, client_mode: bool },
    Connect { addr: SocketAddr, encrypted: bool, client_mode: bool },
    Send { id: TransferId, path: String, offset: u64 },
    Receive { id: TransferId, path: String, offset: u64 },
    Status { id: TransferId },
    Abort { id: TransferId, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SlaveReply {
    Done,
    Checksum(u64),
    Listing(ListingEntry),
    Connect(ConnectInfo),
    Status(TransferProgress),
}

/// Application-level failure; link failures never travel on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireError {
    NotFound(String),
    Io(String),
}

impl From<WireError> for RemoteError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::NotFound(s) => RemoteError::NotFound(s),
            WireError::Io(s) => RemoteError::Io(s),
        }
    }
}

/// REQUEST frame payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub index: u64,
    pub op: SlaveOp,
}

/// RESPONSE frame payload, matched to its request by `index`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub index: u64,
    pub result: Result<SlaveReply, WireError>,
}
