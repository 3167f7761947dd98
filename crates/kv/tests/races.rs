#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::StreamExt;
use keel_kv::{KvBackend, MemoryBackend, MemoryOptions, TxnOutcome};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_cas_wins_per_revision() {
    let kv = MemoryBackend::shared(MemoryOptions::default());
    kv.create("/k", b"0".to_vec()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16u8 {
        let kv = Arc::clone(&kv);
        tasks.push(tokio::spawn(async move { kv.compare_and_swap("/k", 1, vec![i]).await.unwrap() }));
    }
    let mut wins = 0;
    for t in tasks {
        if let TxnOutcome::Committed(kv) = t.await.unwrap() {
            assert_eq!(kv.mod_revision, 2);
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchers_see_per_key_order() {
    let kv = MemoryBackend::shared(MemoryOptions { history_capacity: 64, watch_buffer: 64 });
    let mut w = kv.watch("/k", None).await.unwrap();
    kv.create("/k", Vec::new()).await.unwrap();
    let mut rev = 1;
    for _ in 0..10 {
        match kv.compare_and_swap("/k", rev, Vec::new()).await.unwrap() {
            TxnOutcome::Committed(stored) => rev = stored.mod_revision,
            other => panic!("unexpected {:?}", other),
        }
    }
    let mut last = 0;
    for _ in 0..11 {
        let ev = w.next().await.unwrap().unwrap();
        assert!(ev.revision() > last);
        last = ev.revision();
    }
    assert_eq!(last, rev);
}
