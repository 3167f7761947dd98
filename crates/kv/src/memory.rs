//! In-process MVCC backend: a sorted keyspace, a global revision counter and
//! a bounded history of change events used to resume watches.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::{EventKind, KeyValue, KvBackend, KvError, KvEvent, KvWatch, Revision, TxnOutcome};

#[derive(Debug, Clone, Copy)]
pub struct MemoryOptions {
    /// Events retained for watch resumption; older revisions are compacted.
    pub history_capacity: usize,
    /// Live events buffered per subscriber before it is dropped.
    pub watch_buffer: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self { history_capacity: 1000, watch_buffer: 100 }
    }
}

struct Subscriber {
    prefix: String,
    /// Events at or below this revision are not delivered.
    since: Revision,
    tx: mpsc::Sender<KvEvent>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    revision: Revision,
    data: BTreeMap<String, KeyValue>,
    history: VecDeque<KvEvent>,
    /// Watches must start at or after this revision.
    floor: Revision,
    subscribers: Vec<Subscriber>,
}

pub struct MemoryBackend {
    state: Mutex<State>,
    opts: MemoryOptions,
    latency_ms: AtomicU64,
    unavailable: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(MemoryOptions::default())
    }
}

impl MemoryBackend {
    pub fn new(opts: MemoryOptions) -> Self {
        Self {
            state: Mutex::new(State::default()),
            opts: MemoryOptions {
                history_capacity: opts.history_capacity.max(1),
                watch_buffer: opts.watch_buffer.max(1),
            },
            latency_ms: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn shared(opts: MemoryOptions) -> Arc<Self> {
        Arc::new(Self::new(opts))
    }

    /// Delay applied before every call; the write happens after the delay.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// While set, every call fails with `KvError::Unavailable`.
    pub fn set_unavailable(&self, on: bool) {
        self.unavailable.store(on, Ordering::Relaxed);
    }

    /// Discards history up to and including `revision`.
    pub fn compact(&self, revision: Revision) -> Result<(), KvError> {
        let mut st = self.lock()?;
        while st.history.front().map(|e| e.revision() <= revision).unwrap_or(false) {
            st.history.pop_front();
        }
        st.floor = st.floor.max(revision.min(st.revision));
        debug!(floor = st.floor, "history compacted");
        Ok(())
    }

    /// Live subscribers; closed receivers are pruned first.
    pub fn subscriber_count(&self) -> usize {
        match self.lock() {
            Ok(mut st) => {
                st.subscribers.retain(|s| !s.tx.is_closed());
                st.subscribers.len()
            }
            Err(_) => 0,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, KvError> {
        self.state.lock().map_err(|_| KvError::Internal("state lock poisoned".into()))
    }

    async fn preflight(&self) -> Result<(), KvError> {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(KvError::Unavailable("memory backend marked unavailable".into()));
        }
        Ok(())
    }

    fn commit(&self, st: &mut State, ev: KvEvent) {
        gauge!("kv_revision", ev.revision() as f64);
        st.history.push_back(ev.clone());
        while st.history.len() > self.opts.history_capacity {
            if let Some(old) = st.history.pop_front() {
                st.floor = old.revision();
            }
        }
        st.subscribers.retain(|s| {
            if !ev.kv.key.starts_with(&s.prefix) || ev.revision() <= s.since {
                return !s.tx.is_closed();
            }
            match s.tx.try_send(ev.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    s.overflowed.store(true, Ordering::Release);
                    counter!("kv_watch_overflow_total", 1u64);
                    warn!(prefix = %s.prefix, revision = ev.revision(), "watch subscriber overflowed; dropping");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        self.preflight().await?;
        let st = self.lock()?;
        Ok(st.data.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KeyValue>, Revision), KvError> {
        self.preflight().await?;
        let st = self.lock()?;
        let items = st
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        Ok((items, st.revision))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<TxnOutcome, KvError> {
        self.preflight().await?;
        let mut st = self.lock()?;
        if let Some(existing) = st.data.get(key) {
            return Ok(TxnOutcome::Failed(Some(existing.clone())));
        }
        st.revision += 1;
        let rev = st.revision;
        let kv = KeyValue { key: key.to_string(), value, create_revision: rev, mod_revision: rev };
        st.data.insert(key.to_string(), kv.clone());
        self.commit(&mut st, KvEvent { kind: EventKind::Put, kv: kv.clone(), prev: None });
        Ok(TxnOutcome::Committed(kv))
    }

    async fn compare_and_swap(&self, key: &str, expected: Revision, value: Vec<u8>) -> Result<TxnOutcome, KvError> {
        self.preflight().await?;
        let mut st = self.lock()?;
        let prev = match st.data.get(key) {
            Some(cur) if cur.mod_revision == expected => cur.clone(),
            other => return Ok(TxnOutcome::Failed(other.cloned())),
        };
        st.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.create_revision,
            mod_revision: st.revision,
        };
        st.data.insert(key.to_string(), kv.clone());
        self.commit(&mut st, KvEvent { kind: EventKind::Put, kv: kv.clone(), prev: Some(prev) });
        Ok(TxnOutcome::Committed(kv))
    }

    async fn compare_and_delete(&self, key: &str, expected: Revision) -> Result<TxnOutcome, KvError> {
        self.preflight().await?;
        let mut st = self.lock()?;
        let prev = match st.data.get(key) {
            Some(cur) if cur.mod_revision == expected => cur.clone(),
            other => return Ok(TxnOutcome::Failed(other.cloned())),
        };
        st.data.remove(key);
        st.revision += 1;
        let tomb = KeyValue { mod_revision: st.revision, ..prev.clone() };
        self.commit(&mut st, KvEvent { kind: EventKind::Delete, kv: tomb.clone(), prev: Some(prev) });
        Ok(TxnOutcome::Committed(tomb))
    }

    async fn watch(&self, prefix: &str, since: Option<Revision>) -> Result<KvWatch, KvError> {
        self.preflight().await?;
        let mut st = self.lock()?;
        let since = since.unwrap_or(st.revision);
        if since < st.floor {
            return Err(KvError::Compacted { requested: since, oldest: st.floor });
        }
        let replay: Vec<KvEvent> = st
            .history
            .iter()
            .filter(|e| e.revision() > since && e.kv.key.starts_with(prefix))
            .cloned()
            .collect();
        let (tx, rx) = mpsc::channel(self.opts.watch_buffer + replay.len());
        let replayed = replay.len();
        for ev in replay {
            // capacity covers the whole replay
            let _ = tx.try_send(ev);
        }
        let overflowed = Arc::new(AtomicBool::new(false));
        st.subscribers.push(Subscriber { prefix: prefix.to_string(), since, tx, overflowed: Arc::clone(&overflowed) });
        debug!(prefix, since, replayed, "watch registered");
        Ok(KvWatch::new(rx, overflowed))
    }

    async fn current_revision(&self) -> Result<Revision, KvError> {
        self.preflight().await?;
        Ok(self.lock()?.revision)
    }
}
