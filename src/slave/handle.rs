use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::transport::{ConnectInfo, SlaveTransport, TransferId, TransferProgress};
use crate::error::RemoteError;
use crate::listing::ListingEntry;
use crate::transfer::Direction;

type PendingConnect = JoinHandle<Result<ConnectInfo, RemoteError>>;

/// The master's view of one slave.
///
/// A handle lives for as long as the slave is registered, across any number
/// of link drops: tree nodes keep pointing at it while the slave is offline,
/// and a reconnect attaches a fresh transport to the same handle.
pub struct SlaveHandle {
    name: String,
    transport: RwLock<Option<Arc<dyn SlaveTransport>>>,
    available: AtomicBool,
    last_upload: AtomicI64,
    last_download: AtomicI64,
    /// Outstanding transfers, keyed by slave-assigned id
    transfers: Mutex<HashMap<TransferId, Option<Direction>>>,
    tickets: Mutex<HashMap<u64, PendingConnect>>,
    next_ticket: AtomicU64,
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl SlaveHandle {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            transport: RwLock::new(None),
            available: AtomicBool::new(false),
            last_upload: AtomicI64::new(0),
            last_download: AtomicI64::new(0),
            transfers: Mutex::new(HashMap::new()),
            tickets: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            reconcile_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Handle with a transport attached, not yet available
    pub fn with_transport(name: impl Into<String>, transport: Arc<dyn SlaveTransport>) -> Arc<Self> {
        let handle = Self::new(name);
        handle.attach(transport);
        handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attach(&self, transport: Arc<dyn SlaveTransport>) {
        *self.transport.write() = Some(transport);
    }

    pub fn is_connected(&self) -> bool {
        self.transport.read().is_some()
    }

    /// Detach only while `transport` is still the attached one; a
    /// reconnect may already have replaced it.
    pub fn detach_transport(&self, transport: &Arc<dyn SlaveTransport>, cause: &str) -> bool {
        {
            let mut slot = self.transport.write();
            let same = slot
                .as_ref()
                .is_some_and(|t| Arc::as_ptr(t) as *const () == Arc::as_ptr(transport) as *const ());
            if !same {
                return false;
            }
            slot.take();
        }
        self.detach(cause);
        true
    }

    /// Drop the transport and go offline; pending tickets are cancelled
    pub fn detach(&self, cause: &str) {
        self.transport.write().take();
        for (_, pending) in self.tickets.lock().drain() {
            pending.abort();
        }
        self.mark_unavailable(cause);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Online once a remerge completed; a handle without transport stays offline
    pub fn set_available(&self) -> bool {
        if self.transport.read().is_none() {
            return false;
        }
        if !self.available.swap(true, Ordering::AcqRel) {
            debug!("slave {} is online", self.name);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn force_available(&self) {
        self.available.store(true, Ordering::Release);
    }

    pub fn mark_unavailable(&self, cause: &str) {
        if self.available.swap(false, Ordering::AcqRel) {
            warn!("slave {} is offline: {}", self.name, cause);
        }
    }

    fn transport(&self) -> Result<Arc<dyn SlaveTransport>, RemoteError> {
        self.transport
            .read()
            .clone()
            .ok_or_else(|| RemoteError::Communication(format!("{} is not connected", self.name)))
    }

    fn check<T>(&self, result: Result<T, RemoteError>) -> Result<T, RemoteError> {
        if let Err(e) = &result {
            if e.is_communication() {
                self.mark_unavailable(&e.to_string());
            }
        }
        result
    }

    pub async fn remote_delete(&self, path: &str) -> Result<(), RemoteError> {
        let t = self.check(self.transport())?;
        self.check(t.delete(path).await)
    }

    pub async fn remote_rename(&self, from: &str, to_dir: &str, to_name: &str) -> Result<(), RemoteError> {
        let t = self.check(self.transport())?;
        self.check(t.rename(from, to_dir, to_name).await)
    }

    pub async fn remote_checksum(&self, path: &str) -> Result<u64, RemoteError> {
        let t = self.check(self.transport())?;
        self.check(t.checksum(path).await)
    }

    pub async fn remote_listing(&self, path: &str, recursive: bool) -> Result<ListingEntry, RemoteError> {
        let t = self.check(self.transport())?;
        self.check(t.listing(path, recursive).await)
    }

    fn queue(&self, pending: PendingConnect) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.tickets.lock().insert(ticket, pending);
        ticket
    }

    /// Ask the slave to open a passive socket; collect with `fetch_transfer`
    pub fn issue_listen(&self, encrypted: bool, client_mode: bool) -> Result<u64, RemoteError> {
        let t = self.check(self.transport())?;
        Ok(self.queue(tokio::spawn(async move { t.listen(encrypted, client_mode).await })))
    }

    /// Ask the slave to connect to a client; collect with `fetch_transfer`
    pub fn issue_connect(
        &self,
        addr: SocketAddr,
        encrypted: bool,
        client_mode: bool,
    ) -> Result<u64, RemoteError> {
        let t = self.check(self.transport())?;
        Ok(self.queue(tokio::spawn(async move {
            t.connect(addr, encrypted, client_mode).await
        })))
    }

    pub async fn fetch_transfer(self: &Arc<Self>, ticket: u64) -> Result<Transfer, RemoteError> {
        let pending = self
            .tickets
            .lock()
            .remove(&ticket)
            .ok_or_else(|| RemoteError::Io(format!("unknown ticket {} on {}", ticket, self.name)))?;
        let info = match pending.await {
            Ok(r) => self.check(r)?,
            Err(e) => {
                let err = RemoteError::Communication(e.to_string());
                self.mark_unavailable(&err.to_string());
                return Err(err);
            }
        };
        self.transfers.lock().insert(info.transfer, None);
        Ok(Transfer {
            slave: self.clone(),
            info,
        })
    }

    pub fn last_transfer(&self, direction: Direction) -> i64 {
        match direction {
            Direction::Upload => self.last_upload.load(Ordering::Relaxed),
            Direction::Download => self.last_download.load(Ordering::Relaxed),
        }
    }

    pub fn set_last_transfer(&self, direction: Direction, millis: i64) {
        match direction {
            Direction::Upload => self.last_upload.store(millis, Ordering::Relaxed),
            Direction::Download => self.last_download.store(millis, Ordering::Relaxed),
        }
    }

    pub fn active_transfers(&self) -> usize {
        self.transfers.lock().len()
    }

    /// Held for the duration of one reconciliation pass against this slave
    pub fn reconcile_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.reconcile_lock
    }
}

impl PartialEq for SlaveHandle {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for SlaveHandle {}

impl fmt::Debug for SlaveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveHandle")
            .field("name", &self.name)
            .field("available", &self.is_available())
            .finish()
    }
}

impl fmt::Display for SlaveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_available() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}-OFFLINE", self.name)
        }
    }
}

/// A data-channel transfer bound to the slave that set it up.
/// Dropping it removes it from the slave's outstanding transfers.
pub struct Transfer {
    slave: Arc<SlaveHandle>,
    info: ConnectInfo,
}

impl Transfer {
    pub fn slave(&self) -> &Arc<SlaveHandle> {
        &self.slave
    }

    pub fn id(&self) -> TransferId {
        self.info.transfer
    }

    pub fn addr(&self) -> SocketAddr {
        self.info.addr
    }

    fn start(&self, direction: Direction) {
        self.slave.transfers.lock().insert(self.info.transfer, Some(direction));
        self.slave
            .set_last_transfer(direction, chrono::Utc::now().timestamp_millis());
    }

    pub async fn send_file(&self, path: &str, offset: u64) -> Result<(), RemoteError> {
        let t = self.slave.check(self.slave.transport())?;
        self.start(Direction::Download);
        self.slave.check(t.send_file(self.info.transfer, path, offset).await)
    }

    pub async fn receive_file(&self, path: &str, offset: u64) -> Result<(), RemoteError> {
        let t = self.slave.check(self.slave.transport())?;
        self.start(Direction::Upload);
        self.slave
            .check(t.receive_file(self.info.transfer, path, offset).await)
    }

    pub async fn status(&self) -> Result<TransferProgress, RemoteError> {
        let t = self.slave.check(self.slave.transport())?;
        self.slave.check(t.status(self.info.transfer).await)
    }

    pub async fn abort(&self, reason: &str) -> Result<(), RemoteError> {
        let t = self.slave.check(self.slave.transport())?;
        self.slave.check(t.abort(self.info.transfer, reason).await)
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        self.slave.transfers.lock().remove(&self.info.transfer);
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("slave", &self.slave.name)
            .field("id", &self.info.transfer)
            .field("addr", &self.info.addr)
            .finish()
    }
}
