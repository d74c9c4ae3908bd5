//! Tree nodes
//!
//! Every node carries its own locks: a directory's child map and a file's
//! owner set are the only state mutated from several tasks at once, and each
//! mutation is one critical section on one node. When a parent's child map
//! and a node's own state are both needed, the parent's map is locked first.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::checksum;
use crate::error::{VfsError, VfsResult};
use crate::slave::SlaveHandle;

#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Milliseconds since the epoch
    pub last_modified: i64,
    pub owner: String,
    pub group: String,
}

#[derive(Debug, Default)]
pub struct FileState {
    pub length: u64,
    /// `checksum::UNKNOWN` until computed
    pub checksum: u64,
    pub xfer_time_ms: u64,
    pub slaves: Vec<Arc<SlaveHandle>>,
}

pub struct FileData {
    state: Mutex<FileState>,
    /// Serialises checksum fetches for this file
    checksum_lock: tokio::sync::Mutex<()>,
}

pub enum NodeKind {
    Directory(Mutex<HashMap<String, Arc<Node>>>),
    File(FileData),
}

pub struct Node {
    name: RwLock<String>,
    parent: RwLock<Weak<Node>>,
    deleted: AtomicBool,
    meta: Mutex<Metadata>,
    kind: NodeKind,
}

impl Node {
    pub(crate) fn new_root() -> Arc<Node> {
        Arc::new(Node {
            name: RwLock::new(String::new()),
            parent: RwLock::new(Weak::new()),
            deleted: AtomicBool::new(false),
            meta: Mutex::new(Metadata::default()),
            kind: NodeKind::Directory(Mutex::new(HashMap::new())),
        })
    }

    pub(crate) fn new_directory(name: &str, meta: Metadata) -> Arc<Node> {
        Arc::new(Node {
            name: RwLock::new(name.to_string()),
            parent: RwLock::new(Weak::new()),
            deleted: AtomicBool::new(false),
            meta: Mutex::new(meta),
            kind: NodeKind::Directory(Mutex::new(HashMap::new())),
        })
    }

    pub(crate) fn new_file(
        name: &str,
        length: u64,
        meta: Metadata,
        slaves: Vec<Arc<SlaveHandle>>,
    ) -> Arc<Node> {
        Arc::new(Node {
            name: RwLock::new(name.to_string()),
            parent: RwLock::new(Weak::new()),
            deleted: AtomicBool::new(false),
            meta: Mutex::new(meta),
            kind: NodeKind::File(FileData {
                state: Mutex::new(FileState {
                    length,
                    checksum: checksum::UNKNOWN,
                    xfer_time_ms: 0,
                    slaves,
                }),
                checksum_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.read().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Node>) {
        *self.parent.write() = Arc::downgrade(parent);
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Absolute virtual path; `/` for the root
    pub fn path(&self) -> String {
        let mut parts = vec![self.name()];
        let mut cur = self.parent();
        while let Some(node) = cur {
            if node.is_root() {
                break;
            }
            parts.push(node.name());
            cur = node.parent();
        }
        if self.is_root() {
            return "/".to_string();
        }
        let mut path = String::new();
        for part in parts.iter().rev() {
            path.push('/');
            path.push_str(part);
        }
        path
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File(_))
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn metadata(&self) -> Metadata {
        self.meta.lock().clone()
    }

    pub fn last_modified(&self) -> i64 {
        self.meta.lock().last_modified
    }

    pub fn set_last_modified(&self, millis: i64) {
        self.meta.lock().last_modified = millis;
    }

    // ---- directory side ----

    pub(crate) fn children_map(&self) -> VfsResult<&Mutex<HashMap<String, Arc<Node>>>> {
        match &self.kind {
            NodeKind::Directory(children) => Ok(children),
            NodeKind::File(_) => Err(VfsError::NotADirectory(self.path())),
        }
    }

    /// Snapshot of all children, tombstones included
    pub fn children(&self) -> Vec<Arc<Node>> {
        match &self.kind {
            NodeKind::Directory(children) => children.lock().values().cloned().collect(),
            NodeKind::File(_) => Vec::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        match &self.kind {
            NodeKind::Directory(children) => children.lock().get(name).cloned(),
            NodeKind::File(_) => None,
        }
    }

    pub fn child_count(&self) -> usize {
        match &self.kind {
            NodeKind::Directory(children) => children.lock().len(),
            NodeKind::File(_) => 0,
        }
    }

    /// Insert `child` unless the name is taken; returns the occupant otherwise
    pub(crate) fn insert_child(self: &Arc<Self>, child: Arc<Node>) -> VfsResult<Result<(), Arc<Node>>> {
        let mut children = self.children_map()?.lock();
        let name = child.name();
        if let Some(existing) = children.get(&name) {
            return Ok(Err(existing.clone()));
        }
        child.set_parent(self);
        children.insert(name, child);
        drop(children);
        self.set_last_modified(chrono::Utc::now().timestamp_millis());
        Ok(Ok(()))
    }

    /// Number of files below this node owned by `slave`
    pub fn files_on(&self, slave: &SlaveHandle) -> usize {
        match &self.kind {
            NodeKind::File(_) => usize::from(self.has_slave(slave)),
            NodeKind::Directory(_) => self.children().iter().map(|c| c.files_on(slave)).sum(),
        }
    }

    // ---- file side ----

    fn file(&self) -> VfsResult<&FileData> {
        match &self.kind {
            NodeKind::File(f) => Ok(f),
            NodeKind::Directory(_) => Err(VfsError::NotAFile(self.path())),
        }
    }

    pub(crate) fn file_state(&self) -> VfsResult<MutexGuard<'_, FileState>> {
        Ok(self.file()?.state.lock())
    }

    pub(crate) fn checksum_lock(&self) -> VfsResult<&tokio::sync::Mutex<()>> {
        Ok(&self.file()?.checksum_lock)
    }

    /// File length; a directory reports its child count
    pub fn length(&self) -> u64 {
        match &self.kind {
            NodeKind::File(f) => f.state.lock().length,
            NodeKind::Directory(children) => children.lock().len() as u64,
        }
    }

    pub fn set_length(&self, length: u64) -> VfsResult<()> {
        self.file()?.state.lock().length = length;
        Ok(())
    }

    pub fn cached_checksum(&self) -> u64 {
        match &self.kind {
            NodeKind::File(f) => f.state.lock().checksum,
            NodeKind::Directory(_) => checksum::UNKNOWN,
        }
    }

    pub fn set_checksum(&self, sum: u64) -> VfsResult<()> {
        self.file()?.state.lock().checksum = sum;
        Ok(())
    }

    pub fn xfer_time_ms(&self) -> u64 {
        match &self.kind {
            NodeKind::File(f) => f.state.lock().xfer_time_ms,
            NodeKind::Directory(_) => 0,
        }
    }

    pub fn set_xfer_time_ms(&self, millis: u64) -> VfsResult<()> {
        self.file()?.state.lock().xfer_time_ms = millis;
        Ok(())
    }

    /// Bytes per second of the upload that produced this file
    pub fn xfer_speed(&self) -> u64 {
        match &self.kind {
            NodeKind::File(f) => {
                let st = f.state.lock();
                if st.xfer_time_ms == 0 {
                    0
                } else {
                    st.length * 1000 / st.xfer_time_ms
                }
            }
            NodeKind::Directory(_) => 0,
        }
    }

    /// Snapshot of the owner set
    pub fn slaves(&self) -> Vec<Arc<SlaveHandle>> {
        match &self.kind {
            NodeKind::File(f) => f.state.lock().slaves.clone(),
            NodeKind::Directory(_) => Vec::new(),
        }
    }

    pub fn slave_count(&self) -> usize {
        match &self.kind {
            NodeKind::File(f) => f.state.lock().slaves.len(),
            NodeKind::Directory(_) => 0,
        }
    }

    pub fn has_slave(&self, slave: &SlaveHandle) -> bool {
        match &self.kind {
            NodeKind::File(f) => f.state.lock().slaves.iter().any(|s| **s == *slave),
            NodeKind::Directory(_) => false,
        }
    }

    /// Add an owner; returns false when already present
    pub fn add_slave(&self, slave: &Arc<SlaveHandle>) -> VfsResult<bool> {
        let mut st = self.file()?.state.lock();
        if st.slaves.iter().any(|s| s == slave) {
            return Ok(false);
        }
        st.slaves.push(slave.clone());
        Ok(true)
    }

    /// Remove an owner; returns false when it was not an owner
    pub fn remove_slave(&self, slave: &SlaveHandle) -> bool {
        match &self.kind {
            NodeKind::File(f) => {
                let mut st = f.state.lock();
                let before = st.slaves.len();
                st.slaves.retain(|s| **s != *slave);
                st.slaves.len() != before
            }
            NodeKind::Directory(_) => false,
        }
    }

    /// A file with an offline owner, or a directory holding one
    pub fn has_offline_slaves(&self) -> bool {
        match &self.kind {
            NodeKind::File(f) => f.state.lock().slaves.iter().any(|s| !s.is_available()),
            NodeKind::Directory(_) => self.children().iter().any(|c| c.has_offline_slaves()),
        }
    }

    /// A file is available when at least one owner is online; directories always are
    pub fn is_available(&self) -> bool {
        match &self.kind {
            NodeKind::File(f) => f.state.lock().slaves.iter().any(|s| s.is_available()),
            NodeKind::Directory(_) => true,
        }
    }

    pub fn available_slaves(&self) -> Vec<Arc<SlaveHandle>> {
        self.slaves()
            .into_iter()
            .filter(|s| s.is_available())
            .collect()
    }

    /// One-line debug description listing owners, offline ones suffixed
    pub fn describe(&self) -> String {
        let mut out = format!("Node[{:?},", self.name());
        if self.is_deleted() {
            out.push_str("deleted,");
        }
        match &self.kind {
            NodeKind::File(f) => {
                let st = f.state.lock();
                let _ = write!(out, "length:{},xfertime:{},slaves:[", st.length, st.xfer_time_ms);
                let owners: Vec<String> = st.slaves.iter().map(|s| s.to_string()).collect();
                out.push_str(&owners.join(","));
                out.push(']');
            }
            NodeKind::Directory(children) => {
                let _ = write!(out, "directory({})", children.lock().len());
            }
        }
        out.push(']');
        out
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}
