use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use super::handle::SlaveHandle;
use super::transport::SlaveTransport;

/// Registry of known slaves by name
#[derive(Default)]
pub struct SlaveManager {
    slaves: RwLock<BTreeMap<String, Arc<SlaveHandle>>>,
}

impl SlaveManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `transport` to the slave called `name`, creating the handle on
    /// first contact. A reconnecting slave gets its old handle back so tree
    /// nodes that still reference it come back online with it.
    pub fn register(&self, name: &str, transport: Arc<dyn SlaveTransport>) -> Arc<SlaveHandle> {
        let mut slaves = self.slaves.write();
        match slaves.get(name) {
            Some(existing) => {
                existing.attach(transport);
                info!("slave {} reconnected", name);
                existing.clone()
            }
            None => {
                let handle = SlaveHandle::with_transport(name, transport);
                slaves.insert(name.to_string(), handle.clone());
                info!("slave {} registered", name);
                handle
            }
        }
    }

    /// Forget a slave; the caller unmerges it from the tree
    pub fn deregister(&self, name: &str) -> Option<Arc<SlaveHandle>> {
        let removed = self.slaves.write().remove(name);
        if let Some(handle) = &removed {
            handle.detach("deregistered");
            info!("slave {} deregistered", name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<SlaveHandle>> {
        self.slaves.read().get(name).cloned()
    }

    pub fn slaves(&self) -> Vec<Arc<SlaveHandle>> {
        self.slaves.read().values().cloned().collect()
    }

    pub fn available_slaves(&self) -> Vec<Arc<SlaveHandle>> {
        self.slaves
            .read()
            .values()
            .filter(|s| s.is_available())
            .cloned()
            .collect()
    }
}
