use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use keel_core::{Node, NodeSpec, StorageConfig};
use keel_kv::{KvBackend, MemoryBackend, MemoryOptions};
use keel_selector::Selector;
use keel_store::{EventType, ListOptions, RequestContext, Storage, StoreError, WatchEvent, WatchStream};
use tokio_util::sync::CancellationToken;

fn storage_with(opts: MemoryOptions) -> (Storage, Arc<MemoryBackend>) {
    let mem = MemoryBackend::shared(opts);
    let backend: Arc<dyn KvBackend> = mem.clone();
    (Storage::new(&StorageConfig::default(), backend).unwrap(), mem)
}

fn storage() -> Storage {
    storage_with(MemoryOptions::default()).0
}

fn node(name: &str) -> Node {
    Node::new("prod", name, NodeSpec { node_group_name: "workers".into(), host_name: None })
}

fn prod() -> RequestContext {
    RequestContext::new("prod")
}

async fn next(stream: &mut WatchStream<NodeSpec>) -> Result<WatchEvent<NodeSpec>, StoreError> {
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("watch event within deadline")
        .expect("stream still open")
}

#[tokio::test]
async fn watch_from_version_delivers_later_modifications_in_order() {
    let s = storage();
    let created = s.nodes.create(&prod(), node("n1")).await.unwrap();
    let v = created.resource_version().to_string();

    let mut stream = s.nodes.watch(&prod(), &ListOptions::everything(), &v).await.unwrap();
    let u1 = s.nodes.update(&prod(), "n1", None, |n| n.spec.host_name = Some("h1".into())).await.unwrap();
    let u2 = s.nodes.update(&prod(), "n1", None, |n| n.spec.host_name = Some("h2".into())).await.unwrap();

    let e1 = next(&mut stream).await.unwrap();
    let e2 = next(&mut stream).await.unwrap();
    assert_eq!((e1.type_, e1.resource_version.as_str()), (EventType::Modified, u1.resource_version()));
    assert_eq!((e2.type_, e2.resource_version.as_str()), (EventType::Modified, u2.resource_version()));
    assert_eq!(e2.object.spec.host_name.as_deref(), Some("h2"));
    assert!(tokio::time::timeout(Duration::from_millis(50), stream.next()).await.is_err());
}

#[tokio::test]
async fn watch_replays_history_after_version() {
    let s = storage();
    let list = s.nodes.list(&prod(), &ListOptions::everything()).await.unwrap();
    s.nodes.create(&prod(), node("n1")).await.unwrap();
    s.nodes.delete(&prod(), "n1", None).await.unwrap();

    let mut stream = s.nodes.watch(&prod(), &ListOptions::everything(), list.resource_version()).await.unwrap();
    assert_eq!(next(&mut stream).await.unwrap().type_, EventType::Added);
    let deleted = next(&mut stream).await.unwrap();
    assert_eq!(deleted.type_, EventType::Deleted);
    assert_eq!(deleted.object.name(), "n1");
}

#[tokio::test]
async fn watch_from_future_version_skips_writes_up_to_it() {
    let s = storage();
    s.nodes.create(&prod(), node("n1")).await.unwrap();

    let mut stream = s.nodes.watch(&prod(), &ListOptions::everything(), "4").await.unwrap();
    for host in ["h1", "h2", "h3"] {
        let u = s.nodes.update(&prod(), "n1", None, |n| n.spec.host_name = Some(host.into())).await.unwrap();
        assert!(u.resource_version().parse::<u64>().unwrap() <= 4);
    }
    let after = s.nodes.update(&prod(), "n1", None, |n| n.spec.host_name = Some("h4".into())).await.unwrap();

    let ev = next(&mut stream).await.unwrap();
    assert_eq!(ev.resource_version, after.resource_version());
    assert_eq!(ev.object.spec.host_name.as_deref(), Some("h4"));
}

#[tokio::test]
async fn watch_translates_selector_transitions() {
    let s = storage();
    s.nodes.create(&prod(), node("n1").with_labels([("role", "web")])).await.unwrap();
    let opts = ListOptions::new(Selector::parse("role=web", "").unwrap());
    let mut stream = s.nodes.watch(&prod(), &opts, "").await.unwrap();

    s.nodes.update(&prod(), "n1", None, |n| { n.metadata.labels.insert("role".into(), "db".into()); }).await.unwrap();
    s.nodes.create(&prod(), node("n2").with_labels([("role", "db")])).await.unwrap();
    s.nodes.update(&prod(), "n1", None, |n| { n.metadata.labels.insert("role".into(), "web".into()); }).await.unwrap();

    let left = next(&mut stream).await.unwrap();
    assert_eq!((left.type_, left.object.name()), (EventType::Deleted, "n1"));
    let back = next(&mut stream).await.unwrap();
    assert_eq!((back.type_, back.object.name()), (EventType::Added, "n1"));
}

#[tokio::test]
async fn finalized_delete_is_observable() {
    let s = storage();
    s.nodes.create(&prod(), node("n1").with_finalizers(["keel.io/drain"])).await.unwrap();
    let mut stream = s.nodes.watch(&prod(), &ListOptions::everything(), "").await.unwrap();

    s.nodes.delete(&prod(), "n1", None).await.unwrap();
    let marked = next(&mut stream).await.unwrap();
    assert_eq!(marked.type_, EventType::Modified);
    assert!(marked.object.metadata.deletion_timestamp.is_some());

    s.nodes.update(&prod(), "n1", None, |n| { n.metadata.finalizers.clear(); }).await.unwrap();
    let gone = next(&mut stream).await.unwrap();
    assert_eq!(gone.type_, EventType::Deleted);
}

#[tokio::test]
async fn watch_only_sees_its_namespace() {
    let s = storage();
    let mut stream = s.nodes.watch(&prod(), &ListOptions::everything(), "").await.unwrap();
    let mut other = node("n1");
    other.metadata.namespace = "prod2".into();
    s.nodes.create(&RequestContext::new("prod2"), other).await.unwrap();
    s.nodes.create(&prod(), node("n2")).await.unwrap();
    let ev = next(&mut stream).await.unwrap();
    assert_eq!((ev.object.namespace(), ev.object.name()), ("prod", "n2"));
}

#[tokio::test]
async fn compacted_version_requires_resync() {
    let (s, _mem) = storage_with(MemoryOptions { history_capacity: 2, watch_buffer: 100 });
    let first = s.nodes.create(&prod(), node("n1")).await.unwrap();
    for i in 0..4 {
        s.nodes.update(&prod(), "n1", None, |n| n.spec.host_name = Some(format!("h{i}"))).await.unwrap();
    }
    let err = s.nodes.watch(&prod(), &ListOptions::everything(), first.resource_version()).await.unwrap_err();
    assert!(matches!(err, StoreError::TooOldResourceVersion { .. }));
    assert!(err.is_resync_required());
    assert_eq!(err.status_code(), 410);
}

#[tokio::test]
async fn slow_subscriber_is_terminated_with_resync_signal() {
    let (s, mem) = storage_with(MemoryOptions { history_capacity: 100, watch_buffer: 2 });
    let mut stream = s.nodes.watch(&prod(), &ListOptions::everything(), "").await.unwrap();
    for i in 0..5 {
        s.nodes.create(&prod(), node(&format!("n{i}"))).await.unwrap();
    }
    assert_eq!(mem.subscriber_count(), 0);

    let mut delivered = 0;
    loop {
        match next(&mut stream).await {
            Ok(_) => delivered += 1,
            Err(e) => {
                assert!(matches!(e, StoreError::WatchOverflow));
                assert!(e.is_resync_required());
                break;
            }
        }
    }
    assert_eq!(delivered, 2);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn cancellation_ends_stream_and_releases_subscriber() {
    let (s, mem) = storage_with(MemoryOptions::default());
    let token = CancellationToken::new();
    let ctx = prod().with_cancel(token.clone());
    let mut stream = s.nodes.watch(&ctx, &ListOptions::everything(), "").await.unwrap();
    assert_eq!(mem.subscriber_count(), 1);

    token.cancel();
    let end = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap();
    assert!(end.is_none());
    drop(stream);
    assert_eq!(mem.subscriber_count(), 0);
}

#[tokio::test]
async fn malformed_version_is_invalid() {
    let s = storage();
    let err = s.nodes.watch(&prod(), &ListOptions::everything(), "latest").await.err().unwrap();
    assert!(err.is_invalid());
}
