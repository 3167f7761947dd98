//! Already-resolved storage configuration. Values come from the environment
//! (`KEEL_*`) or a deserialized document; they only affect how stores are
//! instantiated, never their algorithmic contract.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::object::Kind;

pub const DEFAULT_PREFIX: &str = "/keel";
pub const DEFAULT_WATCH_BUFFER: usize = 100;
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
pub const DEFAULT_CAPACITY_HINT: usize = 1000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONCURRENT_SYNCS: u32 = 5;
pub const DEFAULT_MIN_RESYNC_SECS: u64 = 12 * 60 * 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("key prefix {0:?} must start with '/' and not end with '/'")]
    Prefix(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Connection parameters for the replicated key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendConfig {
    pub endpoints: Vec<String>,
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { endpoints: Vec::new(), request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS }
    }
}

/// Tuning consumed by the external controllers that sit on top of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerSyncConfig {
    pub concurrent_cluster_syncs: u32,
    pub concurrent_node_group_syncs: u32,
    pub concurrent_node_syncs: u32,
    pub concurrent_master_node_syncs: u32,
    pub min_resync_secs: u64,
}

impl Default for ControllerSyncConfig {
    fn default() -> Self {
        Self {
            concurrent_cluster_syncs: DEFAULT_CONCURRENT_SYNCS,
            concurrent_node_group_syncs: DEFAULT_CONCURRENT_SYNCS,
            concurrent_node_syncs: DEFAULT_CONCURRENT_SYNCS,
            concurrent_master_node_syncs: DEFAULT_CONCURRENT_SYNCS,
            min_resync_secs: DEFAULT_MIN_RESYNC_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Deployment-wide key prefix, e.g. `/keel`.
    pub prefix: String,
    /// Per-subscriber watch buffer; overflow terminates the stream.
    pub watch_buffer: usize,
    /// Number of change events retained for watch resumption.
    pub history_capacity: usize,
    /// Expected object count per kind; sizing hint for derived caches.
    pub capacity_hints: BTreeMap<Kind, usize>,
    pub backend: BackendConfig,
    pub controllers: ControllerSyncConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            watch_buffer: DEFAULT_WATCH_BUFFER,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            capacity_hints: BTreeMap::new(),
            backend: BackendConfig::default(),
            controllers: ControllerSyncConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Builds a config from an arbitrary key lookup; unparsable values fall
    /// back to the default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> T {
            match lookup(key) {
                Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
                    warn!(key, value = %raw, "ignoring unparsable setting");
                    default
                }),
                None => default,
            }
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        let mut cfg = Self::default();
        if let Some(p) = lookup("KEEL_PREFIX") {
            cfg.prefix = p;
        }
        cfg.watch_buffer = parsed(lookup, "KEEL_WATCH_BUFFER", cfg.watch_buffer);
        cfg.history_capacity = parsed(lookup, "KEEL_HISTORY_CAPACITY", cfg.history_capacity);
        cfg.backend.request_timeout_ms = parsed(lookup, "KEEL_REQUEST_TIMEOUT_MS", cfg.backend.request_timeout_ms);
        if let Some(eps) = lookup("KEEL_BACKEND_ENDPOINTS") {
            cfg.backend.endpoints =
                eps.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
        for kind in Kind::ALL {
            let key = format!("KEEL_CAPACITY_{}", kind.plural().to_ascii_uppercase());
            if let Some(n) = lookup(&key).and_then(|s| s.trim().parse::<usize>().ok()) {
                cfg.capacity_hints.insert(kind, n);
            }
        }
        let c = &mut cfg.controllers;
        c.concurrent_cluster_syncs = parsed(lookup, "KEEL_CONCURRENT_CLUSTER_SYNCS", c.concurrent_cluster_syncs);
        c.concurrent_node_group_syncs = parsed(lookup, "KEEL_CONCURRENT_NODE_GROUP_SYNCS", c.concurrent_node_group_syncs);
        c.concurrent_node_syncs = parsed(lookup, "KEEL_CONCURRENT_NODE_SYNCS", c.concurrent_node_syncs);
        c.concurrent_master_node_syncs =
            parsed(lookup, "KEEL_CONCURRENT_MASTER_NODE_SYNCS", c.concurrent_master_node_syncs);
        c.min_resync_secs = parsed(lookup, "KEEL_MIN_RESYNC_SECS", c.min_resync_secs);
        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.prefix.starts_with('/') || (self.prefix.len() > 1 && self.prefix.ends_with('/')) {
            return Err(ConfigError::Prefix(self.prefix.clone()));
        }
        if self.watch_buffer == 0 {
            return Err(ConfigError::Zero("watch buffer"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Zero("history capacity"));
        }
        if self.backend.request_timeout_ms == 0 {
            return Err(ConfigError::Zero("request timeout"));
        }
        let c = &self.controllers;
        if c.concurrent_cluster_syncs == 0
            || c.concurrent_node_group_syncs == 0
            || c.concurrent_node_syncs == 0
            || c.concurrent_master_node_syncs == 0
        {
            return Err(ConfigError::Zero("concurrent syncs"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.request_timeout_ms)
    }

    pub fn capacity_hint(&self, kind: Kind) -> usize {
        self.capacity_hints.get(&kind).copied().unwrap_or(DEFAULT_CAPACITY_HINT)
    }

    /// Prefix with the trailing slash of a root prefix removed, ready for joining.
    pub fn normalized_prefix(&self) -> &str {
        if self.prefix == "/" {
            ""
        } else {
            &self.prefix
        }
    }
}
