//! Derived in-memory cache of one kind, fed by List + Watch.
//!
//! Deltas from the watch are coalesced per object key and folded into an
//! immutable [`Snapshot`] on a short tick; readers load the current snapshot
//! without locking and can subscribe to the epoch counter to learn about
//! swaps. The cache is never authoritative: a resync signal, a closed
//! stream or a coalescer overflow all throw it away and re-list.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use keel_core::{Object, Spec};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::error::StoreError;
use crate::store::{GenericStore, ListOptions};
use crate::watch::{EventType, WatchEvent};

const TICK: Duration = Duration::from_millis(8);
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// `namespace/name`, or just `name` for cluster-scoped objects.
pub fn object_key<S: Spec>(obj: &Object<S>) -> String {
    if obj.metadata.namespace.is_empty() {
        obj.metadata.name.clone()
    } else {
        format!("{}/{}", obj.metadata.namespace, obj.metadata.name)
    }
}

#[derive(Debug, Clone)]
pub enum Delta<S: Spec> {
    Upsert(Object<S>),
    Remove { key: String, resource_version: String },
}

impl<S: Spec> Delta<S> {
    fn key(&self) -> String {
        match self {
            Delta::Upsert(obj) => object_key(obj),
            Delta::Remove { key, .. } => key.clone(),
        }
    }

    fn resource_version(&self) -> &str {
        match self {
            Delta::Upsert(obj) => obj.resource_version(),
            Delta::Remove { resource_version, .. } => resource_version,
        }
    }

    fn from_event(ev: WatchEvent<S>) -> Self {
        match ev.type_ {
            EventType::Added | EventType::Modified => Delta::Upsert(ev.object),
            EventType::Deleted => Delta::Remove { key: object_key(&ev.object), resource_version: ev.resource_version },
        }
    }
}

/// Coalescing queue keyed by object key, FIFO by first arrival, bounded.
pub struct Coalescer<S: Spec> {
    map: FxHashMap<String, Delta<S>>,
    order: VecDeque<String>,
    cap: usize,
    overflowed: bool,
}

impl<S: Spec> Coalescer<S> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), overflowed: false }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Set once a delta could not be queued; the cache must then re-list.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn push(&mut self, d: Delta<S>) {
        let key = d.key();
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                self.overflowed = true;
                return;
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, d);
    }

    pub fn drain_ready(&mut self) -> Vec<Delta<S>> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
        self.overflowed = false;
    }
}

/// Immutable view of the cache at one epoch.
#[derive(Debug, Clone)]
pub struct Snapshot<S: Spec> {
    pub epoch: u64,
    /// Resource version the snapshot reflects.
    pub resource_version: String,
    items: FxHashMap<String, Object<S>>,
}

impl<S: Spec> Default for Snapshot<S> {
    fn default() -> Self {
        Self { epoch: 0, resource_version: String::new(), items: FxHashMap::default() }
    }
}

impl<S: Spec> Snapshot<S> {
    pub fn get(&self, namespace: &str, name: &str) -> Option<&Object<S>> {
        let key = if namespace.is_empty() { name.to_string() } else { format!("{namespace}/{name}") };
        self.items.get(&key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items sorted by key.
    pub fn items(&self) -> Vec<&Object<S>> {
        let mut v: Vec<(&String, &Object<S>)> = self.items.iter().collect();
        v.sort_by(|a, b| a.0.cmp(b.0));
        v.into_iter().map(|(_, o)| o).collect()
    }
}

/// Coalesced batches arrive in first-seen key order, not revision order.
fn is_newer(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(c), Ok(cur)) => c > cur,
        (Ok(_), Err(_)) => true,
        _ => false,
    }
}

/// Builds snapshots from a full listing plus deltas.
pub struct SnapshotBuilder<S: Spec> {
    epoch: u64,
    resource_version: String,
    items: FxHashMap<String, Object<S>>,
}

impl<S: Spec> SnapshotBuilder<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            epoch: 0,
            resource_version: String::new(),
            items: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    /// Replaces the contents with a fresh listing.
    pub fn reset(&mut self, items: Vec<Object<S>>, resource_version: String) {
        self.items.clear();
        for obj in items {
            self.items.insert(object_key(&obj), obj);
        }
        self.resource_version = resource_version;
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn apply(&mut self, batch: Vec<Delta<S>>) {
        for d in batch {
            if is_newer(d.resource_version(), &self.resource_version) {
                self.resource_version = d.resource_version().to_string();
            }
            match d {
                Delta::Upsert(obj) => {
                    self.items.insert(object_key(&obj), obj);
                }
                Delta::Remove { key, .. } => {
                    self.items.remove(&key);
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<Snapshot<S>> {
        Arc::new(Snapshot { epoch: self.epoch, resource_version: self.resource_version.clone(), items: self.items.clone() })
    }
}

/// Read side of a running reflector.
pub struct ReflectorHandle<S: Spec> {
    snap: Arc<ArcSwap<Snapshot<S>>>,
    epoch_rx: watch::Receiver<u64>,
    stop: tokio_util::sync::CancellationToken,
    task: JoinHandle<()>,
}

impl<S: Spec> ReflectorHandle<S> {
    pub fn current(&self) -> Arc<Snapshot<S>> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    /// Waits until a snapshot satisfying `pred` has been published.
    pub async fn wait_until<F>(&self, mut pred: F) -> Arc<Snapshot<S>>
    where
        F: FnMut(&Snapshot<S>) -> bool,
    {
        let mut rx = self.epoch_rx.clone();
        loop {
            let snap = self.current();
            if pred(&snap) {
                return snap;
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

/// Spawns a List + Watch loop for `store`, scoped by `ctx`, filtered by `opts`.
/// `cap` bounds the number of distinct keys coalesced between ticks.
pub fn spawn_reflector<S: Spec>(
    store: GenericStore<S>,
    ctx: RequestContext,
    opts: ListOptions,
    cap: usize,
) -> ReflectorHandle<S> {
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let mut ctx = ctx;
    ctx.cancel = ctx.cancel.child_token();
    let stop = ctx.cancel.clone();
    let snap_clone = Arc::clone(&snap);

    let task = tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = SnapshotBuilder::new(cap);
        let publish = |builder: &SnapshotBuilder<S>| {
            let next = builder.freeze();
            let epoch = next.epoch;
            gauge!("reflector_items", next.len() as f64, "kind" => S::KIND.as_str());
            snap_clone.store(next);
            let _ = epoch_tx.send(epoch);
        };

        'relist: while !ctx.is_canceled() {
            let list = match store.list(&ctx, &opts).await {
                Ok(list) => list,
                Err(StoreError::Canceled) => break,
                Err(e) => {
                    warn!(kind = %S::KIND, error = %e, "reflector list failed; retrying");
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_BACKOFF) => continue,
                    }
                }
            };
            let rv = list.metadata.resource_version.clone();
            info!(kind = %S::KIND, items = list.items.len(), rv = %rv, "reflector listed");
            coalescer.clear();
            builder.reset(list.items, rv.clone());
            publish(&builder);

            let mut stream = match store.watch(&ctx, &opts, &rv).await {
                Ok(s) => s,
                Err(StoreError::Canceled) => break,
                Err(e) => {
                    warn!(kind = %S::KIND, error = %e, "reflector watch failed; re-listing");
                    continue;
                }
            };
            let mut ticker = tokio::time::interval(TICK);
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break 'relist,
                    maybe = stream.next() => match maybe {
                        Some(Ok(ev)) => {
                            coalescer.push(Delta::from_event(ev));
                            if coalescer.overflowed() {
                                counter!("watch_resync_total", 1u64, "kind" => S::KIND.as_str());
                                warn!(kind = %S::KIND, cap, "reflector coalescer overflowed; re-listing");
                                continue 'relist;
                            }
                        }
                        Some(Err(e)) => {
                            if e.is_resync_required() {
                                warn!(kind = %S::KIND, error = %e, "reflector resync");
                            } else {
                                warn!(kind = %S::KIND, error = %e, "reflector watch error; re-listing");
                            }
                            continue 'relist;
                        }
                        None => {
                            debug!(kind = %S::KIND, "watch stream closed; re-listing");
                            continue 'relist;
                        }
                    },
                    _ = ticker.tick() => {
                        let batch = coalescer.drain_ready();
                        if !batch.is_empty() {
                            builder.apply(batch);
                            publish(&builder);
                        }
                    }
                }
            }
        }
        info!(kind = %S::KIND, "reflector stopped");
    });

    ReflectorHandle { snap, epoch_rx, stop, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Host, HostSpec};

    fn host(name: &str, rv: &str) -> Host {
        let mut h = Host::new("", name, HostSpec { address: "10.0.0.1".into(), ..Default::default() });
        h.metadata.resource_version = rv.into();
        h
    }

    #[test]
    fn coalescer_keeps_latest_per_key() {
        let mut c = Coalescer::with_capacity(4);
        c.push(Delta::Upsert(host("a", "1")));
        c.push(Delta::Upsert(host("b", "2")));
        c.push(Delta::Upsert(host("a", "3")));
        assert_eq!(c.len(), 2);
        let out = c.drain_ready();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].resource_version(), "3");
        assert!(c.is_empty());
    }

    #[test]
    fn coalescer_overflow_flags_resync() {
        let mut c = Coalescer::with_capacity(1);
        c.push(Delta::Upsert(host("a", "1")));
        c.push(Delta::Upsert(host("b", "2")));
        assert!(c.overflowed());
        c.clear();
        assert!(!c.overflowed());
    }

    #[test]
    fn builder_applies_deltas() {
        let mut b = SnapshotBuilder::new(8);
        b.reset(vec![host("a", "1"), host("b", "2")], "2".into());
        b.apply(vec![Delta::Remove { key: "a".into(), resource_version: "3".into() }, Delta::Upsert(host("c", "4"))]);
        let snap = b.freeze();
        assert_eq!(snap.epoch, 2);
        assert_eq!(snap.resource_version, "4");
        assert!(snap.get("", "a").is_none());
        let names: Vec<&str> = snap.items().iter().map(|o| o.name()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn builder_reports_highest_revision_in_batch() {
        let mut b = SnapshotBuilder::new(8);
        b.reset(vec![host("a", "1"), host("b", "2")], "5".into());
        b.apply(vec![Delta::Upsert(host("a", "7")), Delta::Upsert(host("b", "6"))]);
        assert_eq!(b.freeze().resource_version, "7");
        b.apply(vec![Delta::Upsert(host("b", "3"))]);
        assert_eq!(b.freeze().resource_version, "7");
    }
}
