//! Key-value backend contract consumed by the resource store.
//!
//! A backend offers atomic put-if-absent, compare-and-swap and
//! compare-and-delete keyed on a key's last modification revision, plus an
//! ordered change feed per key prefix. Revisions come from one
//! backend-global counter, so every write to a key strictly increases its
//! `mod_revision`.

#![forbid(unsafe_code)]

pub mod memory;
mod watch;

pub use memory::{MemoryBackend, MemoryOptions};
pub use watch::KvWatch;

use async_trait::async_trait;

pub type Revision = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One entry of the change feed. For deletes, `kv` carries the last value
/// and `kv.mod_revision` is the revision of the delete itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
    pub prev: Option<KeyValue>,
}

impl KvEvent {
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }

    /// A put that brought the key into existence.
    pub fn is_create(&self) -> bool {
        self.kind == EventKind::Put && self.prev.is_none()
    }
}

/// Result of a conditional write. On failure the current value (if any) is
/// returned so the caller can tell a missing key from a version mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed(KeyValue),
    Failed(Option<KeyValue>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("revision {requested} has been compacted (oldest watchable {oldest})")]
    Compacted { requested: Revision, oldest: Revision },
    #[error("watch buffer overflowed; subscriber dropped")]
    Overflowed,
    #[error("backend error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError>;

    /// All keys under `prefix`, in key order, and the revision the read was served at.
    async fn list(&self, prefix: &str) -> Result<(Vec<KeyValue>, Revision), KvError>;

    /// Writes `value` only if `key` is absent.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<TxnOutcome, KvError>;

    /// Writes `value` only if the key's `mod_revision` equals `expected`.
    async fn compare_and_swap(&self, key: &str, expected: Revision, value: Vec<u8>) -> Result<TxnOutcome, KvError>;

    /// Removes `key` only if its `mod_revision` equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: Revision) -> Result<TxnOutcome, KvError>;

    /// Change feed for keys under `prefix`, strictly after `since`
    /// (`None` starts at the current revision).
    async fn watch(&self, prefix: &str, since: Option<Revision>) -> Result<KvWatch, KvError>;

    async fn current_revision(&self) -> Result<Revision, KvError>;
}
