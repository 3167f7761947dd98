use std::sync::Arc;
use std::time::Duration;

use keel_core::{Node, NodeSpec, StorageConfig};
use keel_kv::{KvBackend, MemoryBackend, MemoryOptions};
use keel_store::{RequestContext, Storage, StoreError};
use tokio_util::sync::CancellationToken;

fn storage_with(config: StorageConfig) -> (Storage, Arc<MemoryBackend>) {
    let mem = MemoryBackend::shared(MemoryOptions::default());
    let backend: Arc<dyn KvBackend> = mem.clone();
    (Storage::new(&config, backend).unwrap(), mem)
}

fn node(name: &str) -> Node {
    Node::new("prod", name, NodeSpec { node_group_name: "workers".into(), host_name: None })
}

fn prod() -> RequestContext {
    RequestContext::new("prod")
}

#[tokio::test]
async fn racing_updates_from_same_version_have_one_winner() {
    let (s, _mem) = storage_with(StorageConfig::default());
    let created = s.nodes.create(&prod(), node("n1")).await.unwrap();
    let v: u64 = created.resource_version().parse().unwrap();
    let rv = created.resource_version().to_string();

    let ctx = prod();
    let (a, b) = tokio::join!(
        s.nodes.update(&ctx, "n1", Some(&rv), |n| n.spec.host_name = Some("a".into())),
        s.nodes.update(&ctx, "n1", Some(&rv), |n| n.spec.host_name = Some("b".into())),
    );
    let (ok, err) = match (a, b) {
        (Ok(o), Err(e)) | (Err(e), Ok(o)) => (o, e),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert_eq!(ok.resource_version(), (v + 1).to_string());
    assert!(err.is_conflict());
}

#[tokio::test]
async fn interleaved_read_modify_write_conflicts() {
    let (s, mem) = storage_with(StorageConfig::default());
    s.nodes.create(&prod(), node("n1")).await.unwrap();
    mem.set_latency(Duration::from_millis(20));

    let ctx = prod();
    let (a, b) = tokio::join!(
        s.nodes.update(&ctx, "n1", None, |n| n.spec.host_name = Some("a".into())),
        s.nodes.update(&ctx, "n1", None, |n| n.spec.host_name = Some("b".into())),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|x| **x).count(), 1);
    let loser = a.err().or(b.err()).unwrap();
    assert!(loser.is_conflict());
}

#[tokio::test]
async fn canceled_create_leaves_backend_unchanged() {
    let (s, mem) = storage_with(StorageConfig::default());
    mem.set_latency(Duration::from_millis(200));
    let token = CancellationToken::new();
    let ctx = prod().with_cancel(token.clone());

    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let err = s.nodes.create(&ctx, node("n1")).await.unwrap_err();
    cancel.await.unwrap();
    assert!(matches!(err, StoreError::Canceled));

    mem.set_latency(Duration::ZERO);
    assert!(s.nodes.get(&prod(), "n1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn already_canceled_request_fails_fast() {
    let (s, _mem) = storage_with(StorageConfig::default());
    let token = CancellationToken::new();
    token.cancel();
    let err = s.nodes.get(&prod().with_cancel(token), "n1").await.unwrap_err();
    assert_eq!(err, StoreError::Canceled);
}

#[tokio::test]
async fn slow_backend_times_out_as_unavailable() {
    let mut config = StorageConfig::default();
    config.backend.request_timeout_ms = 30;
    let (s, mem) = storage_with(config);
    mem.set_latency(Duration::from_millis(300));
    let err = s.nodes.get(&prod(), "n1").await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
    assert_eq!(err.status_code(), 503);
}

#[tokio::test]
async fn unavailable_backend_is_surfaced_without_retry() {
    let (s, mem) = storage_with(StorageConfig::default());
    mem.set_unavailable(true);
    let err = s.nodes.create(&prod(), node("n1")).await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
    mem.set_unavailable(false);
    assert!(s.nodes.get(&prod(), "n1").await.unwrap_err().is_not_found());
}
