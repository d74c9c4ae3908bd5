//! Scripted slave transport and helpers shared by the integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use dftpd::config::Config;
use dftpd::error::RemoteError;
use dftpd::listing::{ListingEntry, ListingKind};
use dftpd::session::Context;
use dftpd::slave::selection::{Filter, ScoreChart};
use dftpd::slave::{ConnectInfo, SelectionContext, SlaveHandle, SlaveTransport, TransferId, TransferProgress};
use dftpd::transfer::{Direction, MemoryAccounting};

/// A slave that answers from a script and records every call
pub struct MockSlave {
    pub listing: Mutex<ListingEntry>,
    pub calls: Mutex<Vec<String>>,
    pub delete_error: Mutex<Option<RemoteError>>,
    pub checksum: AtomicU64,
    /// What `status` reports for every transfer
    pub progress: Mutex<TransferProgress>,
    /// Make `status` fail instead
    pub status_error: Mutex<Option<RemoteError>>,
    pub listen_error: Mutex<Option<RemoteError>>,
    next_id: AtomicU64,
}

impl MockSlave {
    pub fn new(listing: ListingEntry) -> Arc<Self> {
        Arc::new(Self {
            listing: Mutex::new(listing),
            calls: Mutex::new(Vec::new()),
            delete_error: Mutex::new(None),
            checksum: AtomicU64::new(0),
            progress: Mutex::new(TransferProgress::default()),
            status_error: Mutex::new(None),
            listen_error: Mutex::new(None),
            next_id: AtomicU64::new(0),
        })
    }

    /// Every transfer finishes at once with `bytes` moved
    pub fn finish_with(&self, bytes: u64, checksum: u64) {
        *self.progress.lock() = TransferProgress {
            transferred: bytes,
            checksum,
            elapsed_ms: 10,
            finished: true,
            error: None,
        };
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn info(&self, addr: SocketAddr) -> ConnectInfo {
        ConnectInfo {
            transfer: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            addr,
        }
    }
}

#[async_trait]
impl SlaveTransport for MockSlave {
    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.record(format!("delete {}", path));
        match self.delete_error.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn rename(&self, from: &str, to_dir: &str, to_name: &str) -> Result<(), RemoteError> {
        self.record(format!("rename {} {} {}", from, to_dir, to_name));
        Ok(())
    }

    async fn checksum(&self, path: &str) -> Result<u64, RemoteError> {
        self.record(format!("checksum {}", path));
        Ok(self.checksum.load(Ordering::Relaxed))
    }

    async fn listing(&self, path: &str, recursive: bool) -> Result<ListingEntry, RemoteError> {
        self.record(format!("listing {}", path));
        let mut entry = self.listing.lock().clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            entry = match entry.child(part) {
                Some(child) if child.is_directory() => child.clone(),
                _ => return Err(RemoteError::NotFound(path.to_string())),
            };
        }
        if !recursive {
            if let ListingKind::Directory { entries } = &mut entry.kind {
                for e in entries.iter_mut() {
                    if let ListingKind::Directory { entries } = &mut e.kind {
                        entries.clear();
                    }
                }
            }
        }
        Ok(entry)
    }

    async fn listen(&self, _encrypted: bool, _client_mode: bool) -> Result<ConnectInfo, RemoteError> {
        self.record("listen".to_string());
        if let Some(e) = self.listen_error.lock().clone() {
            return Err(e);
        }
        Ok(self.info("10.0.0.5:40000".parse().unwrap()))
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        _encrypted: bool,
        _client_mode: bool,
    ) -> Result<ConnectInfo, RemoteError> {
        self.record(format!("connect {}", addr));
        Ok(self.info(addr))
    }

    async fn send_file(&self, id: TransferId, path: &str, offset: u64) -> Result<(), RemoteError> {
        self.record(format!("send {} {} {}", id, path, offset));
        Ok(())
    }

    async fn receive_file(&self, id: TransferId, path: &str, offset: u64) -> Result<(), RemoteError> {
        self.record(format!("receive {} {} {}", id, path, offset));
        Ok(())
    }

    async fn status(&self, id: TransferId) -> Result<TransferProgress, RemoteError> {
        self.record(format!("status {}", id));
        if let Some(e) = self.status_error.lock().clone() {
            return Err(e);
        }
        Ok(self.progress.lock().clone())
    }

    async fn abort(&self, id: TransferId, reason: &str) -> Result<(), RemoteError> {
        self.record(format!("abort {} {}", id, reason));
        Ok(())
    }
}

/// Selection filter that only counts how often selection ran
#[derive(Clone, Default)]
pub struct CountingFilter(pub Arc<AtomicUsize>);

impl CountingFilter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Filter for CountingFilter {
    fn process(&self, _chart: &mut ScoreChart, _direction: Direction, _ctx: &SelectionContext, _now: i64) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handle with `mock` attached and online, not registered anywhere
pub fn online(name: &str, mock: &Arc<MockSlave>) -> Arc<SlaveHandle> {
    let transport: Arc<dyn SlaveTransport> = mock.clone();
    let slave = SlaveHandle::with_transport(name, transport);
    assert!(slave.set_available());
    slave
}

/// Context whose accounting can be inspected afterwards
pub fn context(config: Config) -> (Context, Arc<MemoryAccounting>) {
    let accounting = Arc::new(MemoryAccounting::new());
    let mut ctx = Context::new(config);
    ctx.accounting = accounting.clone();
    (ctx, accounting)
}

pub fn file(name: &str, length: u64) -> ListingEntry {
    ListingEntry::file(name, length, 1_700_000_000_000)
}

pub fn dir(name: &str, entries: Vec<ListingEntry>) -> ListingEntry {
    ListingEntry::dir(name, entries)
}

pub fn root(entries: Vec<ListingEntry>) -> ListingEntry {
    ListingEntry::root(entries)
}
