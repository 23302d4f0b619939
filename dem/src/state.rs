//! Process-wide state: the configuration graph behind one
//! reader/writer lock, the store, the dispatcher, the aggregator
//! runtime and the AEN registry, shared by the REST handlers, the
//! pseudo controller workers and the periodic tick thread.

use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
};

use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::{
    aen::AenRegistry,
    config::{store::Store, Config},
    dispatch::Dispatcher,
    interfaces::HostIface,
    logpages::Aggregator,
};

pub struct ManagerState {
    pub config: RwLock<Config>,
    pub store: Store,
    pub aen: Arc<AenRegistry>,
    pub dispatch: Dispatcher,
    pub aggregator: Mutex<Aggregator>,
    pub stopped: Arc<AtomicBool>,
    pub signature: RwLock<Option<String>>,
    pub signature_path: Option<PathBuf>,
    pub interfaces: Vec<HostIface>,
}

impl ManagerState {
    pub fn build(
        store: Store,
        interfaces: Vec<HostIface>,
        signature_path: Option<PathBuf>,
    ) -> Result<Arc<Self>, crate::error::ModelError> {
        let config = store.load()?;
        let signature = signature_path.as_deref().and_then(load_signature);
        Ok(Arc::new(ManagerState {
            config: RwLock::new(config),
            store,
            aen: Arc::new(AenRegistry::default()),
            dispatch: Dispatcher::default(),
            aggregator: Mutex::new(Aggregator::default()),
            stopped: Arc::new(AtomicBool::new(false)),
            signature: RwLock::new(signature),
            signature_path,
            interfaces,
        }))
    }

    /// Write-through after a successful mutation. A failing dump keeps
    /// the in-memory view authoritative and the daemon serving.
    pub fn persist(&self) {
        let config = self.config.read();
        if let Err(e) = self.store.save(&config) {
            error!("config dump failed, continuing with in-memory view: {}", e);
        }
    }

    pub fn publish_aen(&self, hosts: Vec<String>) {
        self.aen.publish(hosts);
    }
}

/// The signature file carries the base64 credential; the header value
/// compared against is `Basic <sig>`.
pub fn load_signature(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let sig = text.trim();
            if sig.is_empty() {
                None
            } else {
                info!("authorization signature loaded from {:?}", path);
                Some(format!("Basic {}", sig))
            }
        }
        Err(_) => None,
    }
}
