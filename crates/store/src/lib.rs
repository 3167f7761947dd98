//! Generic resource storage over a key-value backend.
//!
//! A [`GenericStore`] turns a typed object plus its registry descriptor into
//! create/get/list/update/delete/watch with optimistic concurrency and
//! finalizer-gated deletion. [`StatusStore`] is the status-only view of the
//! same keys, and the reflector keeps a derived, rebuildable cache.

#![forbid(unsafe_code)]

mod codec;
mod context;
mod error;
pub mod reflector;
mod status;
mod store;
mod watch;

use std::sync::Arc;

use keel_core::{ClusterSpec, HostSpec, NodeGroupSpec, NodeSpec, StorageConfig};
use keel_kv::KvBackend;
use keel_registry::{Registry, RegistryError};
use tracing::info;

pub use context::RequestContext;
pub use error::StoreError;
pub use reflector::{spawn_reflector, ReflectorHandle, Snapshot};
pub use status::StatusStore;
pub use store::{DeleteOutcome, GenericStore, ListOptions};
pub use watch::{EventType, WatchEvent, WatchStream};

/// One store per kind over a shared backend and registry.
#[derive(Debug, Clone)]
pub struct Storage {
    pub registry: Arc<Registry>,
    pub clusters: GenericStore<ClusterSpec>,
    pub hosts: GenericStore<HostSpec>,
    pub node_groups: GenericStore<NodeGroupSpec>,
    pub nodes: GenericStore<NodeSpec>,
}

impl Storage {
    /// Validates the configuration and key layout before any store exists.
    pub fn new(config: &StorageConfig, backend: Arc<dyn KvBackend>) -> Result<Self, RegistryError> {
        let registry = Arc::new(Registry::new(config)?);
        info!(prefix = %registry.prefix(), timeout_ms = config.backend.request_timeout_ms, "storage ready");
        Ok(Self {
            clusters: GenericStore::new(&registry, Arc::clone(&backend), config),
            hosts: GenericStore::new(&registry, Arc::clone(&backend), config),
            node_groups: GenericStore::new(&registry, Arc::clone(&backend), config),
            nodes: GenericStore::new(&registry, backend, config),
            registry,
        })
    }
}
