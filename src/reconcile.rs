//! Slave lifecycle on the master: accepting slave links, merging their
//! listings into the tree, and the periodic maintenance sweep.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::error::{RemoteError, VfsError, VfsResult};
use crate::protocol_core::join_path;
use crate::session::Context;
use crate::slave::net::{accept_slave, LinkEnd};
use crate::slave::{SlaveHandle, SlaveTransport};
use crate::vfs::{Node, NodeKind};

/// What one maintenance sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Tombstoned files whose delete was re-issued
    pub retried: usize,
    /// Tombstones that are gone from the tree after the sweep
    pub pruned: usize,
    /// Directories old enough to be archived. They are only logged and
    /// reported here; no archive job is started for them.
    pub archive_candidates: Vec<String>,
}

pub struct ReconciliationDriver {
    ctx: Arc<Context>,
}

impl ReconciliationDriver {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Merge the slave's full listing into the tree and bring it online.
    /// The listing is fetched one top-level directory at a time so no single
    /// reply has to carry the whole storage root. Passes against the same
    /// slave never overlap.
    pub async fn remerge_slave(&self, slave: &Arc<SlaveHandle>) -> VfsResult<()> {
        let _pass = slave.reconcile_lock().lock().await;
        let tree = &self.ctx.tree;
        let root = tree.root();

        let top = slave.remote_listing("/", false).await?;
        let mut reported = HashSet::new();
        let mut files = 0;
        let mut follow_ups = 0;
        for entry in top.entries() {
            let entry = if entry.is_directory() {
                match slave.remote_listing(&join_path("/", &entry.name), true).await {
                    Ok(sub) => sub,
                    // gone since the top-level listing
                    Err(RemoteError::NotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            } else {
                entry.clone()
            };
            files += entry.file_count();
            let actions = tree.remerge_child(root, &entry, slave, &mut reported)?;
            follow_ups += actions.len();
            tree.apply_actions(actions, slave).await;
        }
        tree.unmerge_unreported(root, &reported, slave);
        debug!("{}: merged {} files", slave.name(), files);
        if follow_ups > 0 {
            info!("{}: {} follow-up operations after merge", slave.name(), follow_ups);
        }

        if slave.set_available() {
            info!("slave {} is online", slave.name());
            Ok(())
        } else {
            Err(VfsError::NoAvailableSlave(format!(
                "{} disconnected during merge",
                slave.name()
            )))
        }
    }

    /// The slave left in an orderly way: forget it and everything it held
    pub async fn slave_departed(&self, name: &str) {
        let Some(slave) = self.ctx.slaves.deregister(name) else {
            return;
        };
        let _pass = slave.reconcile_lock().lock().await;
        self.ctx.tree.unmerge(self.ctx.tree.root(), &slave);
        info!("slave {} unmerged", name);
    }

    /// Accept slave links forever
    pub async fn serve_slaves(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("accepting slaves on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("slave accept failed: {}", e);
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_link(stream).await {
                    warn!("slave link from {}: {:#}", peer, e);
                }
            });
        }
    }

    async fn handle_link(&self, stream: TcpStream) -> Result<()> {
        let slaves = &self.ctx.slaves;
        let (name, net, reader) = accept_slave(stream, |name| match slaves.get(name) {
            Some(h) if h.is_connected() => Err(format!("a slave named {} is already connected", name)),
            _ => Ok(()),
        })
        .await?;
        info!("slave {} connected from {}", name, net.peer());
        let transport: Arc<dyn SlaveTransport> = net;
        let slave = slaves.register(&name, transport.clone());

        if let Err(e) = self.remerge_slave(&slave).await {
            error!("merge of {} failed: {}", name, e);
        }

        let end = reader
            .await
            .unwrap_or_else(|e| LinkEnd::Lost(format!("link task failed: {}", e)));
        match end {
            LinkEnd::Goodbye => {
                if slave.detach_transport(&transport, "said goodbye") {
                    self.slave_departed(&name).await;
                }
            }
            LinkEnd::Lost(cause) => {
                // files stay in the tree, shown offline until the slave is back
                slave.detach_transport(&transport, &cause);
            }
        }
        Ok(())
    }

    /// One maintenance pass over every section not excluded from archiving
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let cfg = &self.ctx.config;
        let tree = &self.ctx.tree;
        let now = chrono::Utc::now().timestamp_millis();
        let archive_after = cfg.archive.archive_after_minutes as i64 * 60_000;

        let sections: Vec<(String, String)> = if cfg.sections.is_empty() {
            vec![("default".to_string(), "/".to_string())]
        } else {
            cfg.sections
                .iter()
                .map(|(n, p)| (n.clone(), p.clone()))
                .collect()
        };

        for (section, root_path) in sections {
            if cfg.is_archive_excluded(&section) {
                debug!("sweep: section {} excluded", section);
                continue;
            }
            let Ok(root) = tree.lookup_file(&root_path) else {
                debug!("sweep: section {} root {} not in tree", section, root_path);
                continue;
            };
            if !root.is_directory() {
                continue;
            }

            let mut tombstones = Vec::new();
            collect_tombstones(&root, &mut tombstones);
            for node in tombstones {
                if node.is_file() {
                    if node.available_slaves().is_empty() {
                        continue;
                    }
                    report.retried += 1;
                    if let Err(e) = tree.delete(&node).await {
                        warn!("sweep: delete of {} failed: {}", node.path(), e);
                    }
                } else {
                    tree.prune(&node);
                }
                let attached = node
                    .parent()
                    .and_then(|p| p.child(&node.name()))
                    .is_some_and(|c| Arc::ptr_eq(&c, &node));
                if !attached {
                    report.pruned += 1;
                }
            }

            for child in root.children() {
                if child.is_deleted() || !child.is_directory() {
                    continue;
                }
                if now - child.last_modified() >= archive_after {
                    let path = child.path();
                    info!("sweep: {} in section {} is due for archiving", path, section);
                    report.archive_candidates.push(path);
                }
            }
        }
        report
    }

    /// Sweep every `archive.cycle_minutes` until the task is dropped
    pub async fn run_maintenance(self: Arc<Self>) {
        let minutes = self.ctx.config.archive.cycle_minutes.max(1);
        let mut ticker = interval(Duration::from_secs(minutes * 60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires at once; slaves are still connecting then
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = self.sweep().await;
            debug!("sweep done: {:?}", report);
        }
    }
}

/// Tombstoned nodes below `dir`, deepest first
fn collect_tombstones(dir: &Arc<Node>, out: &mut Vec<Arc<Node>>) {
    for child in dir.children() {
        if let NodeKind::Directory(_) = child.kind() {
            collect_tombstones(&child, out);
        }
        if child.is_deleted() {
            out.push(child);
        }
    }
}
