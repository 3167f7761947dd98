use std::sync::Arc;
use std::time::Duration;

use keel_core::{Node, NodeSpec, StorageConfig};
use keel_kv::{KvBackend, MemoryBackend, MemoryOptions};
use keel_store::{spawn_reflector, ListOptions, RequestContext, Storage};

fn storage_with(opts: MemoryOptions) -> Storage {
    let backend: Arc<dyn KvBackend> = MemoryBackend::shared(opts);
    Storage::new(&StorageConfig::default(), backend).unwrap()
}

fn node(name: &str) -> Node {
    Node::new("prod", name, NodeSpec { node_group_name: "workers".into(), host_name: None })
}

fn prod() -> RequestContext {
    RequestContext::new("prod")
}

#[tokio::test]
async fn reflector_tracks_creates_and_deletes() {
    let s = storage_with(MemoryOptions::default());
    s.nodes.create(&prod(), node("seed")).await.unwrap();
    let handle = spawn_reflector(s.nodes.clone(), prod(), ListOptions::everything(), 64);

    for name in ["a", "b"] {
        s.nodes.create(&prod(), node(name)).await.unwrap();
    }
    let snap = tokio::time::timeout(Duration::from_secs(2), handle.wait_until(|snap| snap.len() == 3)).await.unwrap();
    assert!(snap.get("prod", "a").is_some());

    s.nodes.delete(&prod(), "seed", None).await.unwrap();
    let snap = tokio::time::timeout(Duration::from_secs(2), handle.wait_until(|snap| snap.get("prod", "seed").is_none()))
        .await
        .unwrap();
    assert_eq!(snap.len(), 2);
    handle.shutdown().await;
}

#[tokio::test]
async fn reflector_relists_after_overflow() {
    let s = storage_with(MemoryOptions { history_capacity: 1000, watch_buffer: 1 });
    let handle = spawn_reflector(s.nodes.clone(), prod(), ListOptions::everything(), 2);
    for i in 0..20 {
        s.nodes.create(&prod(), node(&format!("n{i:02}"))).await.unwrap();
    }
    let snap = tokio::time::timeout(Duration::from_secs(5), handle.wait_until(|snap| snap.len() == 20)).await.unwrap();
    let names: Vec<&str> = snap.items().iter().map(|n| n.name()).collect();
    assert_eq!(names.first(), Some(&"n00"));
    assert_eq!(names.last(), Some(&"n19"));
    handle.shutdown().await;
}
