//! The merged directory tree
//!
//! Tree mutations are synchronous critical sections on individual nodes.
//! Anything that needs a slave round trip is split in two: a synchronous pass
//! that updates the tree and collects `RemoteAction`s, and an async pass that
//! runs them and applies the outcome. No tree lock is held across an await.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, error, info, warn};

use super::node::{Metadata, Node, NodeKind};
use crate::checksum;
use crate::error::{RemoteError, VfsError, VfsResult};
use crate::listing::{ListingEntry, ListingKind};
use crate::protocol_core::{is_legal_file_name, join_path};
use crate::slave::selection::{SelectionContext, SlaveSelector};
use crate::slave::SlaveHandle;
use crate::transfer::Direction;

/// Outcome of `DirectoryTree::resolve`: the deepest node reached and the
/// part of the path that did not exist, if any.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub node: Arc<Node>,
    pub remainder: Option<String>,
}

impl Resolved {
    pub fn exists(&self) -> bool {
        self.remainder.is_none()
    }
}

/// Slave-side work produced by a remerge pass. Every action targets the
/// slave whose listing was merged.
#[derive(Debug, Clone)]
pub enum RemoteAction {
    /// Delete a stale copy; when the node is given, the slave leaves its
    /// owner set once the copy is gone
    DeleteStale { path: String, node: Option<Arc<Node>> },
    /// Re-issue a pending delete of a tombstoned file
    QueuedDelete { node: Arc<Node> },
    /// Move a divergent-size copy aside; `sibling` is already in the tree
    RenameConflict {
        from: String,
        to_dir: String,
        to_name: String,
        sibling: Arc<Node>,
    },
}

pub struct DirectoryTree {
    root: Arc<Node>,
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryTree {
    pub fn new() -> Self {
        Self {
            root: Node::new_root(),
        }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Walk `path` starting at `cwd` (or the root for absolute paths).
    /// Never fails: a missing component stops the walk and is returned as
    /// the remainder together with everything after it.
    pub fn resolve_from(&self, cwd: &Arc<Node>, path: &str) -> Resolved {
        let mut cur = cwd.clone();
        let mut rest = path;
        if rest.starts_with('/') {
            cur = self.root.clone();
        }
        if rest == "~" {
            cur = self.root.clone();
            rest = "";
        } else if let Some(r) = rest.strip_prefix("~/") {
            cur = self.root.clone();
            rest = r;
        }

        let tokens: Vec<&str> = rest.split('/').filter(|t| !t.is_empty()).collect();
        for (i, tok) in tokens.iter().enumerate() {
            match *tok {
                "." => continue,
                ".." => {
                    if let Some(p) = cur.parent() {
                        cur = p;
                    }
                    continue;
                }
                _ => {}
            }
            match cur.child(tok).filter(|c| !c.is_deleted()) {
                Some(next) => cur = next,
                None => {
                    return Resolved {
                        node: cur,
                        remainder: Some(tokens[i..].join("/")),
                    }
                }
            }
        }
        Resolved {
            node: cur,
            remainder: None,
        }
    }

    pub fn resolve(&self, path: &str) -> Resolved {
        self.resolve_from(&self.root, path)
    }

    /// Node at `path`, or `NotFound`
    pub fn lookup_file(&self, path: &str) -> VfsResult<Arc<Node>> {
        self.lookup_file_from(&self.root, path)
    }

    pub fn lookup_file_from(&self, cwd: &Arc<Node>, path: &str) -> VfsResult<Arc<Node>> {
        let r = self.resolve_from(cwd, path);
        match r.remainder {
            None => Ok(r.node),
            Some(_) => Err(VfsError::NotFound(path.to_string())),
        }
    }

    /// Normalised absolute path for a possibly non-existing `path`
    pub fn lookup_path(&self, cwd: &Arc<Node>, path: &str) -> String {
        let r = self.resolve_from(cwd, path);
        match r.remainder {
            None => r.node.path(),
            Some(rest) => join_path(&r.node.path(), &rest),
        }
    }

    /// Live child `name` of `dir`
    pub fn get_file(&self, dir: &Node, name: &str) -> VfsResult<Arc<Node>> {
        dir.children_map()?;
        dir.child(name)
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| VfsError::NotFound(join_path(&dir.path(), name)))
    }

    /// Stable snapshot of the visible children, sorted by name
    pub fn list_children(&self, dir: &Node) -> VfsResult<Vec<Arc<Node>>> {
        let mut out: Vec<Arc<Node>> = dir
            .children_map()?
            .lock()
            .values()
            .filter(|c| !c.is_deleted())
            .cloned()
            .collect();
        out.sort_by_key(|c| c.name());
        Ok(out)
    }

    pub fn create_directory(
        &self,
        parent: &Arc<Node>,
        name: &str,
        owner: &str,
        group: &str,
    ) -> VfsResult<Arc<Node>> {
        if !is_legal_file_name(name) {
            return Err(VfsError::IllegalName(name.to_string()));
        }
        let node = Node::new_directory(name, metadata_now(owner, group));
        match parent.insert_child(node.clone())? {
            Ok(()) => {
                debug!("created directory {}", node.path());
                Ok(node)
            }
            Err(_) => Err(VfsError::AlreadyExists(join_path(&parent.path(), name))),
        }
    }

    /// New empty file owned by `slave`, for an upload about to start
    pub fn create_file(
        &self,
        parent: &Arc<Node>,
        name: &str,
        owner: &str,
        group: &str,
        slave: &Arc<SlaveHandle>,
    ) -> VfsResult<Arc<Node>> {
        if !is_legal_file_name(name) {
            return Err(VfsError::IllegalName(name.to_string()));
        }
        let node = Node::new_file(name, 0, metadata_now(owner, group), vec![slave.clone()]);
        match parent.insert_child(node.clone())? {
            Ok(()) => Ok(node),
            Err(_) => Err(VfsError::AlreadyExists(join_path(&parent.path(), name))),
        }
    }

    /// Owners of `node` that are online, or `NoAvailableSlave`
    pub fn available_slaves(&self, node: &Node) -> VfsResult<Vec<Arc<SlaveHandle>>> {
        let slaves = node.available_slaves();
        if slaves.is_empty() {
            return Err(VfsError::NoAvailableSlave(format!(
                "{} has 0 slaves online",
                node.path()
            )));
        }
        Ok(slaves)
    }

    /// Remove `node` from its parent when nothing keeps it alive: a file
    /// with no owners, or a tombstoned directory with no children. Emptied
    /// tombstoned ancestors go with it.
    pub(crate) fn prune(&self, node: &Arc<Node>) -> bool {
        let Some(parent) = node.parent() else {
            return false;
        };
        let removed = {
            let Ok(map) = parent.children_map() else {
                return false;
            };
            let mut children = map.lock();
            let name = node.name();
            let attached = children.get(&name).is_some_and(|c| Arc::ptr_eq(c, node));
            let prunable = match node.kind() {
                NodeKind::File(_) => node.slave_count() == 0,
                NodeKind::Directory(c) => node.is_deleted() && c.lock().is_empty(),
            };
            if attached && prunable {
                children.remove(&name);
                true
            } else {
                false
            }
        };
        if removed {
            debug!("pruned {}", node.path());
            if parent.is_deleted() {
                self.prune(&parent);
            }
        }
        removed
    }

    /// Detach `node` unconditionally, whatever its owners
    pub fn discard(&self, node: &Arc<Node>) {
        let Some(parent) = node.parent() else {
            return;
        };
        node.mark_deleted();
        if let Ok(map) = parent.children_map() {
            let mut children = map.lock();
            let name = node.name();
            if children.get(&name).is_some_and(|c| Arc::ptr_eq(c, node)) {
                children.remove(&name);
            }
        }
        if parent.is_deleted() {
            self.prune(&parent);
        }
    }

    /// Delete `node` and everything below it.
    ///
    /// Every copy is deleted on its slave. Copies on offline slaves, or on
    /// slaves that fail with a link error, keep their owner entry: the file
    /// stays tombstoned and the delete is re-issued on that slave's next
    /// remerge. A slave that no longer has the file counts as deleted.
    pub async fn delete(&self, node: &Arc<Node>) -> VfsResult<()> {
        if node.is_root() {
            return Err(VfsError::IllegalName("/".to_string()));
        }
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        collect_subtree(node, &mut files, &mut dirs);
        for n in files.iter().chain(dirs.iter()) {
            n.mark_deleted();
        }

        for file in &files {
            self.delete_copies(file).await;
            self.prune(file);
        }
        // deepest directories first
        for dir in dirs.iter().rev() {
            self.prune(dir);
        }
        Ok(())
    }

    async fn delete_copies(&self, file: &Arc<Node>) {
        let path = file.path();
        for slave in file.slaves() {
            if !slave.is_available() {
                info!("{}: slave {} not available for deletion", path, slave.name());
                continue;
            }
            match slave.remote_delete(&path).await {
                Ok(()) => {
                    file.remove_slave(&slave);
                }
                Err(RemoteError::NotFound(_)) => {
                    warn!("{} missing on {} during delete, assumed deleted", path, slave.name());
                    file.remove_slave(&slave);
                }
                Err(e @ RemoteError::Communication(_)) => {
                    warn!("delete of {} on {} failed: {}", path, slave.name(), e);
                }
                Err(e) => {
                    error!("I/O error deleting {} on {}: {}", path, slave.name(), e);
                }
            }
        }
        if file.slave_count() > 0 {
            let remaining: Vec<String> = file.slaves().iter().map(|s| s.to_string()).collect();
            info!("{} queued for deletion, remaining slaves: [{}]", path, remaining.join(","));
        }
    }

    /// Move `node` to `to_dir_path` under `to_name`.
    ///
    /// Refused while any copy sits on an offline slave. Slave-side failures
    /// are logged and do not stop the move in the tree; the next remerge of
    /// that slave reconciles its copy.
    pub async fn rename(&self, node: &Arc<Node>, to_dir_path: &str, to_name: &str) -> VfsResult<()> {
        if to_name.contains('/') {
            return Err(VfsError::IllegalName(to_name.to_string()));
        }
        if !is_legal_file_name(to_name) {
            return Err(VfsError::IllegalName(to_name.to_string()));
        }
        let to_dir = self.lookup_file(to_dir_path)?;
        if !to_dir.is_directory() {
            return Err(VfsError::NotADirectory(to_dir_path.to_string()));
        }
        let Some(from_dir) = node.parent() else {
            return Err(VfsError::IllegalName("/".to_string()));
        };
        let mut ancestor = Some(to_dir.clone());
        while let Some(a) = ancestor {
            if Arc::ptr_eq(&a, node) {
                return Err(VfsError::IllegalName(format!(
                    "cannot move {} below itself",
                    node.path()
                )));
            }
            ancestor = a.parent();
        }
        if node.has_offline_slaves() {
            return Err(VfsError::OfflineSlaves(node.path()));
        }
        match to_dir.child(to_name) {
            // a tombstone keeps its name until every owner has dropped its copy
            Some(c) if c.is_deleted() => {
                return Err(VfsError::PendingDeletion(join_path(&to_dir.path(), to_name)))
            }
            Some(_) => return Err(VfsError::AlreadyExists(join_path(&to_dir.path(), to_name))),
            None => {}
        }

        let from_path = node.path();
        let to_dir_path = to_dir.path();
        for slave in owners_below(node) {
            if let Err(e) = slave.remote_rename(&from_path, &to_dir_path, to_name).await {
                error!(
                    "rename {} -> {}/{} failed on {}: {}",
                    from_path,
                    to_dir_path,
                    to_name,
                    slave.name(),
                    e
                );
            }
        }

        self.move_node(node, &from_dir, &to_dir, to_name)?;
        info!("renamed {} to {}", from_path, node.path());
        Ok(())
    }

    /// Swap `node` between parent maps. Both maps are locked for the whole
    /// move, in path order when they differ.
    fn move_node(
        &self,
        node: &Arc<Node>,
        from_dir: &Arc<Node>,
        to_dir: &Arc<Node>,
        to_name: &str,
    ) -> VfsResult<()> {
        let from_map = from_dir.children_map()?;
        let to_map = to_dir.children_map()?;
        let from_name = node.name();

        if Arc::ptr_eq(from_dir, to_dir) {
            let mut children = from_map.lock();
            if children.contains_key(to_name) {
                return Err(VfsError::AlreadyExists(join_path(&to_dir.path(), to_name)));
            }
            children.remove(&from_name);
            node.set_name(to_name);
            children.insert(to_name.to_string(), node.clone());
            return Ok(());
        }

        let from_first = from_dir.path() <= to_dir.path();
        let (mut from_children, mut to_children) = if from_first {
            let f = from_map.lock();
            let t = to_map.lock();
            (f, t)
        } else {
            let t = to_map.lock();
            let f = from_map.lock();
            (f, t)
        };
        if to_children.contains_key(to_name) {
            return Err(VfsError::AlreadyExists(join_path(&to_dir.path(), to_name)));
        }
        from_children.remove(&from_name);
        node.set_name(to_name);
        node.set_parent(to_dir);
        to_children.insert(to_name.to_string(), node.clone());
        Ok(())
    }

    /// Merge `slave`'s listing of `dir` into the tree.
    ///
    /// Returns the slave-side work the merge decided on; run it with
    /// `apply_actions`. Kind conflicts below `dir` are logged and leave the
    /// affected subtree as it was.
    pub fn remerge(
        &self,
        dir: &Arc<Node>,
        listing: &ListingEntry,
        slave: &Arc<SlaveHandle>,
    ) -> VfsResult<Vec<RemoteAction>> {
        if !dir.is_directory() {
            return Err(VfsError::StructuralConflict(format!(
                "merge called on non-directory {}",
                dir.describe()
            )));
        }
        if !listing.is_directory() {
            return Err(VfsError::StructuralConflict(format!(
                "merge argument {:?} from {} is not a directory",
                listing.name,
                slave.name()
            )));
        }
        let mut actions = Vec::new();
        self.merge_dir(dir, listing, slave, &mut actions);
        Ok(actions)
    }

    /// Merge one subtree `entry` the slave reports directly below `dir`.
    /// The other children of `dir` are left alone; names the slave turned
    /// out to hold there are added to `reported` for `unmerge_unreported`.
    pub fn remerge_child(
        &self,
        dir: &Arc<Node>,
        entry: &ListingEntry,
        slave: &Arc<SlaveHandle>,
        reported: &mut HashSet<String>,
    ) -> VfsResult<Vec<RemoteAction>> {
        dir.children_map()?;
        let mut actions = Vec::new();
        self.merge_entry(dir, &dir.path(), entry, slave, &mut actions, reported);
        Ok(actions)
    }

    /// Unmerge `slave` from every child of `dir` it did not report
    pub fn unmerge_unreported(&self, dir: &Arc<Node>, reported: &HashSet<String>, slave: &SlaveHandle) {
        for child in dir.children() {
            if !reported.contains(&child.name()) {
                self.unmerge(&child, slave);
            }
        }
    }

    fn merge_dir(
        &self,
        dir: &Arc<Node>,
        listing: &ListingEntry,
        slave: &Arc<SlaveHandle>,
        actions: &mut Vec<RemoteAction>,
    ) {
        let dir_path = dir.path();
        let mut reported: HashSet<String> = HashSet::new();
        for entry in listing.entries() {
            if !self.merge_entry(dir, &dir_path, entry, slave, actions, &mut reported) {
                return;
            }
        }
        // anything the slave did not report is no longer on it
        self.unmerge_unreported(dir, &reported, slave);
    }

    /// False when `dir` cannot hold children at all
    fn merge_entry(
        &self,
        dir: &Arc<Node>,
        dir_path: &str,
        entry: &ListingEntry,
        slave: &Arc<SlaveHandle>,
        actions: &mut Vec<RemoteAction>,
        reported: &mut HashSet<String>,
    ) -> bool {
        if !is_legal_file_name(&entry.name) {
            warn!("{} reported illegal name {:?} in {}", slave.name(), entry.name, dir_path);
            return true;
        }
        reported.insert(entry.name.clone());

        let local = match dir.child(&entry.name) {
            Some(local) => local,
            None => match dir.insert_child(build_subtree(entry, slave)) {
                Ok(Ok(())) => {
                    debug!("{} added from {}", join_path(dir_path, &entry.name), slave.name());
                    return true;
                }
                Ok(Err(occupant)) => occupant,
                Err(_) => return false,
            },
        };

        if local.is_deleted() {
            warn!(
                "queued delete on {} for {}",
                slave.name(),
                join_path(dir_path, &entry.name)
            );
            self.merge_tombstone(dir_path, &local, entry, slave, actions);
            return true;
        }

        match (local.kind(), &entry.kind) {
            (NodeKind::Directory(_), ListingKind::Directory { .. }) => {
                self.merge_dir(&local, entry, slave, actions);
            }
            (NodeKind::File(_), ListingKind::File { length }) => {
                if let Some(sibling) =
                    self.merge_file(dir, dir_path, &local, entry, *length, slave, actions)
                {
                    reported.insert(sibling);
                }
            }
            _ => {
                // the subtree stays as it is, owners included
                let err = VfsError::StructuralConflict(format!(
                    "{} in tree vs {} {:?} from {}",
                    local.describe(),
                    if entry.is_directory() { "directory" } else { "file" },
                    join_path(dir_path, &entry.name),
                    slave.name()
                ));
                error!("{}", err);
            }
        }
        true
    }

    /// `local` is tombstoned but the slave still reports `entry` there.
    /// Every copy the slave holds below it gets deleted; tombstoned files
    /// it owns are released once their delete succeeds.
    fn merge_tombstone(
        &self,
        dir_path: &str,
        local: &Arc<Node>,
        entry: &ListingEntry,
        slave: &Arc<SlaveHandle>,
        actions: &mut Vec<RemoteAction>,
    ) {
        match (local.kind(), &entry.kind) {
            (NodeKind::File(_), ListingKind::File { .. }) => {
                let _ = local.add_slave(slave);
                actions.push(RemoteAction::QueuedDelete { node: local.clone() });
            }
            (NodeKind::Directory(_), ListingKind::Directory { entries }) => {
                let path = join_path(dir_path, &entry.name);
                for child in entries {
                    match local.child(&child.name) {
                        Some(node) => self.merge_tombstone(&path, &node, child, slave, actions),
                        None => {
                            let mut paths = Vec::new();
                            file_paths(child, &path, &mut paths);
                            for path in paths {
                                actions.push(RemoteAction::DeleteStale { path, node: None });
                            }
                        }
                    }
                }
                for child in local.children() {
                    if entry.child(&child.name()).is_none() {
                        self.unmerge(&child, slave);
                    }
                }
            }
            _ => {
                let mut paths = Vec::new();
                file_paths(entry, dir_path, &mut paths);
                for path in paths {
                    actions.push(RemoteAction::DeleteStale { path, node: None });
                }
            }
        }
    }

    /// Merge one reported file into an existing file node. Returns the name
    /// of a conflict sibling when one was created.
    #[allow(clippy::too_many_arguments)]
    fn merge_file(
        &self,
        dir: &Arc<Node>,
        dir_path: &str,
        local: &Arc<Node>,
        entry: &ListingEntry,
        length: u64,
        slave: &Arc<SlaveHandle>,
        actions: &mut Vec<RemoteAction>,
    ) -> Option<String> {
        let path = join_path(dir_path, &entry.name);
        let Ok(mut st) = local.file_state() else {
            return None;
        };

        if st.length != length {
            let sole_owner = st.slaves.len() == 1 && *st.slaves[0] == **slave;
            if sole_owner || st.length == 0 {
                st.length = length;
                st.checksum = checksum::UNKNOWN;
                if !st.slaves.iter().any(|s| s == slave) {
                    st.slaves.push(slave.clone());
                }
                drop(st);
                local.set_last_modified(entry.last_modified);
                debug!("{}: adopted length {} from {}", path, length, slave.name());
                return None;
            }
            if length == 0 {
                drop(st);
                info!("deleting 0 byte {} on {}", path, slave.name());
                actions.push(RemoteAction::DeleteStale {
                    path,
                    node: Some(local.clone()),
                });
                return None;
            }
            drop(st);

            let to_name = format!("{}.{}", entry.name, slave.name());
            let siblings = conflict_siblings(dir, &entry.name);
            if siblings > 0 {
                warn!(
                    "{}: {} differing copies across slaves, needs operator review",
                    path,
                    siblings + 2
                );
            }
            let sibling = Node::new_file(
                &to_name,
                length,
                metadata_at(entry.last_modified),
                vec![slave.clone()],
            );
            match dir.insert_child(sibling.clone()) {
                Ok(Ok(())) => {
                    warn!(
                        "2 or more slaves contained {} with different sizes, renaming copy on {} to {}",
                        path,
                        slave.name(),
                        to_name
                    );
                    actions.push(RemoteAction::RenameConflict {
                        from: path,
                        to_dir: dir_path.to_string(),
                        to_name: to_name.clone(),
                        sibling,
                    });
                    return Some(to_name);
                }
                _ => {
                    warn!(
                        "{}: conflict name {} already taken, leaving copy on {} unmerged",
                        path,
                        to_name,
                        slave.name()
                    );
                    return None;
                }
            }
        }

        if !st.slaves.iter().any(|s| s == slave) {
            st.slaves.push(slave.clone());
        }
        None
    }

    /// Run the slave-side work of a remerge and fold the outcome back
    pub async fn apply_actions(&self, actions: Vec<RemoteAction>, slave: &Arc<SlaveHandle>) {
        for action in actions {
            match action {
                RemoteAction::DeleteStale { path, node } => match slave.remote_delete(&path).await {
                    Ok(()) | Err(RemoteError::NotFound(_)) => {
                        if let Some(node) = node {
                            if node.remove_slave(slave) {
                                self.prune(&node);
                            }
                        }
                    }
                    Err(e) => error!("error deleting stale {} on {}: {}", path, slave.name(), e),
                },
                RemoteAction::QueuedDelete { node } => {
                    let path = node.path();
                    match slave.remote_delete(&path).await {
                        Ok(()) | Err(RemoteError::NotFound(_)) => {
                            node.remove_slave(slave);
                            self.prune(&node);
                        }
                        Err(e) => warn!("queued delete of {} on {} failed: {}", path, slave.name(), e),
                    }
                }
                RemoteAction::RenameConflict {
                    from,
                    to_dir,
                    to_name,
                    sibling,
                } => {
                    if let Err(e) = slave.remote_rename(&from, &to_dir, &to_name).await {
                        error!("rename {} -> {} on {} failed: {}", from, to_name, slave.name(), e);
                        sibling.remove_slave(slave);
                        self.prune(&sibling);
                    }
                }
            }
        }
    }

    /// Remove `slave` from every owner set at or below `node`, pruning
    /// files left without owners and tombstoned directories left empty.
    /// Unmerging a slave that owns nothing is a no-op.
    pub fn unmerge(&self, node: &Arc<Node>, slave: &SlaveHandle) {
        match node.kind() {
            NodeKind::File(_) => {
                if node.remove_slave(slave) {
                    debug!("{} deleted from {}", node.path(), slave.name());
                }
                self.prune(node);
            }
            NodeKind::Directory(_) => {
                for child in node.children() {
                    self.unmerge(&child, slave);
                }
                self.prune(node);
            }
        }
    }

    /// Checksum of a file, fetched from a slave on first use.
    /// Concurrent callers share one fetch. Returns `checksum::UNKNOWN` for
    /// empty files and when no owner is online.
    pub async fn checksum(&self, node: &Arc<Node>, selector: &SlaveSelector) -> VfsResult<u64> {
        let lock = node.checksum_lock()?;
        let cached = node.cached_checksum();
        if cached != checksum::UNKNOWN || node.length() == 0 {
            return Ok(cached);
        }
        let _guard = lock.lock().await;
        let cached = node.cached_checksum();
        if cached != checksum::UNKNOWN {
            return Ok(cached);
        }

        let path = node.path();
        loop {
            let candidates = node.available_slaves();
            let ctx = SelectionContext::for_file(node);
            let slave = match selector.select(&candidates, Direction::Download, &ctx) {
                Ok(s) => s,
                Err(VfsError::NoAvailableSlave(_)) => return Ok(checksum::UNKNOWN),
                Err(e) => return Err(e),
            };
            match slave.remote_checksum(&path).await {
                Ok(sum) => {
                    node.set_checksum(sum)?;
                    return Ok(sum);
                }
                // the handle is offline now and drops out of the candidates
                Err(RemoteError::Communication(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn metadata_now(owner: &str, group: &str) -> Metadata {
    Metadata {
        last_modified: chrono::Utc::now().timestamp_millis(),
        owner: owner.to_string(),
        group: group.to_string(),
    }
}

fn metadata_at(last_modified: i64) -> Metadata {
    Metadata {
        last_modified,
        ..Metadata::default()
    }
}

/// Conflict copies of `name` already in `dir`: files named
/// `<name>.<slave>` held by that very slave
fn conflict_siblings(dir: &Node, name: &str) -> usize {
    dir.children()
        .iter()
        .filter(|c| c.is_file() && !c.is_deleted())
        .filter(|c| {
            let child = c.name();
            c.slaves()
                .iter()
                .any(|s| child == format!("{}.{}", name, s.name()))
        })
        .count()
}

/// Live node for a reported entry, owned by `slave` throughout
fn build_subtree(entry: &ListingEntry, slave: &Arc<SlaveHandle>) -> Arc<Node> {
    match &entry.kind {
        ListingKind::File { length } => Node::new_file(
            &entry.name,
            *length,
            metadata_at(entry.last_modified),
            vec![slave.clone()],
        ),
        ListingKind::Directory { entries } => {
            let dir = Node::new_directory(&entry.name, metadata_at(entry.last_modified));
            for child in entries {
                if !is_legal_file_name(&child.name) {
                    continue;
                }
                let _ = dir.insert_child(build_subtree(child, slave));
            }
            dir.set_last_modified(entry.last_modified);
            dir
        }
    }
}

fn file_paths(entry: &ListingEntry, dir_path: &str, out: &mut Vec<String>) {
    let path = join_path(dir_path, &entry.name);
    match &entry.kind {
        ListingKind::File { .. } => out.push(path),
        ListingKind::Directory { entries } => {
            for e in entries {
                file_paths(e, &path, out);
            }
        }
    }
}

/// Files and directories of a subtree, directories in pre-order
fn collect_subtree(node: &Arc<Node>, files: &mut Vec<Arc<Node>>, dirs: &mut Vec<Arc<Node>>) {
    match node.kind() {
        NodeKind::File(_) => files.push(node.clone()),
        NodeKind::Directory(_) => {
            dirs.push(node.clone());
            for child in node.children() {
                collect_subtree(&child, files, dirs);
            }
        }
    }
}

/// Distinct owners of the files at or below `node`
fn owners_below(node: &Arc<Node>) -> Vec<Arc<SlaveHandle>> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    collect_subtree(node, &mut files, &mut dirs);
    let mut owners: Vec<Arc<SlaveHandle>> = Vec::new();
    for f in files {
        for s in f.slaves() {
            if !owners.contains(&s) {
                owners.push(s);
            }
        }
    }
    owners
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(paths: &[&str]) -> DirectoryTree {
        let tree = DirectoryTree::new();
        for p in paths {
            let mut cur = tree.root().clone();
            for part in p.trim_start_matches('/').split('/') {
                cur = match cur.child(part) {
                    Some(c) => c,
                    None => tree.create_directory(&cur, part, "nobody", "dftpd").unwrap(),
                };
            }
        }
        tree
    }

    #[test]
    fn resolve_reports_remainder() {
        let tree = tree_with(&["/a/b"]);
        let r = tree.resolve("/a/b/c/d");
        assert_eq!(r.node.path(), "/a/b");
        assert_eq!(r.remainder.as_deref(), Some("c/d"));

        let r = tree.resolve("/a/./b/../b");
        assert!(r.exists());
        assert_eq!(r.node.path(), "/a/b");

        // .. at the root stays at the root
        assert_eq!(tree.resolve("/../..").node.path(), "/");
        assert_eq!(tree.resolve("~/a").node.path(), "/a");
    }

    #[test]
    fn resolve_relative_to_cwd() {
        let tree = tree_with(&["/a/b"]);
        let a = tree.lookup_file("/a").unwrap();
        assert_eq!(tree.lookup_file_from(&a, "b").unwrap().path(), "/a/b");
        assert_eq!(tree.lookup_path(&a, "b/new"), "/a/b/new");
        assert_eq!(tree.lookup_path(&a, "/x"), "/x");
        assert!(matches!(tree.lookup_file("/nope"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn create_rejects_duplicates_and_bad_names() {
        let tree = tree_with(&["/a"]);
        let root = tree.root().clone();
        assert!(matches!(
            tree.create_directory(&root, "a", "u", "g"),
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            tree.create_directory(&root, "x/y", "u", "g"),
            Err(VfsError::IllegalName(_))
        ));
        assert!(matches!(
            tree.create_directory(&root, "*", "u", "g"),
            Err(VfsError::IllegalName(_))
        ));
    }

    #[test]
    fn list_children_hides_tombstones() {
        let tree = tree_with(&["/a", "/b"]);
        tree.lookup_file("/a").unwrap().mark_deleted();
        let names: Vec<String> = tree
            .list_children(tree.root())
            .unwrap()
            .iter()
            .map(|n| n.name())
            .collect();
        assert_eq!(names, vec!["b".to_string()]);
        assert!(tree.lookup_file("/a").is_err());
        assert!(matches!(
            tree.get_file(tree.root(), "a"),
            Err(VfsError::NotFound(_))
        ));
        assert_eq!(tree.get_file(tree.root(), "b").unwrap().path(), "/b");
    }

    #[test]
    fn move_node_within_and_across_directories() {
        let tree = tree_with(&["/a/x", "/b"]);
        let x = tree.lookup_file("/a/x").unwrap();
        let a = tree.lookup_file("/a").unwrap();
        let b = tree.lookup_file("/b").unwrap();
        tree.move_node(&x, &a, &a, "y").unwrap();
        assert_eq!(x.path(), "/a/y");
        tree.move_node(&x, &a, &b, "z").unwrap();
        assert_eq!(x.path(), "/b/z");
        assert!(a.child("y").is_none());
    }

    #[test]
    fn conflict_siblings_need_a_slave_suffix() {
        let tree = tree_with(&["/d"]);
        let d = tree.lookup_file("/d").unwrap();
        let (a, b) = (SlaveHandle::new("A"), SlaveHandle::new("B"));
        tree.create_file(&d, "release", "u", "g", &a).unwrap();
        tree.create_file(&d, "release.nfo", "u", "g", &a).unwrap();
        // suffix names a slave that does not hold the copy
        tree.create_file(&d, "release.C", "u", "g", &a).unwrap();
        assert_eq!(conflict_siblings(&d, "release"), 0);

        tree.create_file(&d, "release.B", "u", "g", &b).unwrap();
        assert_eq!(conflict_siblings(&d, "release"), 1);
        tree.create_file(&d, "release.A", "u", "g", &a).unwrap();
        assert_eq!(conflict_siblings(&d, "release"), 2);
    }

    #[test]
    fn prune_cascades_through_tombstoned_parents() {
        let tree = tree_with(&["/a/b"]);
        let b = tree.lookup_file("/a/b").unwrap();
        let a = tree.lookup_file("/a").unwrap();
        let slave = SlaveHandle::new("s");
        let f = tree.create_file(&b, "f", "u", "g", &slave).unwrap();
        a.mark_deleted();
        b.mark_deleted();
        f.remove_slave(&slave);
        assert!(tree.prune(&f));
        assert!(tree.root().child("a").is_none());
    }
}
