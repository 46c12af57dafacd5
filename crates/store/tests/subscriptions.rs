#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tollgate_store::{Snapshot, SnapshotStore};

/// Drain a subscription until it sees `target` version, recording versions.
async fn observe_until(store: &SnapshotStore<String, u32>, target: u64) -> (Vec<u64>, Arc<Snapshot<String, u32>>) {
    let mut sub = store.subscribe(CancellationToken::new());
    let mut versions = Vec::new();
    loop {
        let snap = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("subscription stalled")
            .expect("subscription ended early");
        versions.push(snap.version);
        if snap.version >= target {
            return (versions, snap);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribers_converge_on_final_state() {
    let store: SnapshotStore<String, u32> = SnapshotStore::new("converge");
    let writer = store.clone();

    // Replay a fixed sequence of stores/deletes from a separate task.
    let ops: Vec<(&str, Option<u32>)> = vec![
        ("a", Some(1)),
        ("b", Some(2)),
        ("a", Some(3)),
        ("c", Some(4)),
        ("b", None),
        ("d", Some(5)),
        ("c", None),
        ("a", Some(6)),
    ];
    let mut expected = BTreeMap::new();
    for (k, v) in &ops {
        match v {
            Some(v) => { expected.insert(k.to_string(), *v); }
            None => { expected.remove(*k); }
        }
    }
    let total = ops.len() as u64;

    let observers: Vec<_> = (0..3)
        .map(|_| {
            let s = store.clone();
            tokio::spawn(async move { observe_until(&s, total).await })
        })
        .collect();

    tokio::spawn(async move {
        for (k, v) in ops {
            match v {
                Some(v) => writer.store(k.to_string(), v).expect("store"),
                None => writer.delete(&k.to_string()).expect("delete"),
            };
            tokio::task::yield_now().await;
        }
    });

    for obs in observers {
        let (versions, last) = obs.await.expect("join");
        assert!(versions.windows(2).all(|w| w[0] < w[1]), "versions not increasing: {:?}", versions);
        assert_eq!(last.version, total);
        assert_eq!(last.state, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_get_distinct_versions() {
    let store: SnapshotStore<String, u32> = SnapshotStore::new("writers");
    let mut handles = Vec::new();
    for w in 0..4u32 {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            let mut got = Vec::new();
            for i in 0..50u32 {
                got.push(s.store(format!("w{w}-{i}"), i).expect("store"));
            }
            got
        }));
    }
    let mut all = Vec::new();
    for h in handles {
        let got = h.await.expect("join");
        assert!(got.windows(2).all(|w| w[0] < w[1]));
        all.extend(got);
    }
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 200, "duplicate versions were published");
    assert_eq!(store.version(), 200);
    assert_eq!(store.len(), 200);
}

#[tokio::test]
async fn slow_consumer_sees_coalesced_latest() {
    let store: SnapshotStore<String, u32> = SnapshotStore::new("coalesce");
    let mut sub = store.subscribe(CancellationToken::new());
    assert_eq!(sub.recv().await.map(|s| s.version), Some(0));

    for i in 0..100u32 {
        store.store("k".to_string(), i).expect("store");
    }
    let next = sub.recv().await.expect("snapshot");
    assert_eq!(next.version, 100);
    assert_eq!(next.get(&"k".to_string()), Some(&99));
}

#[tokio::test]
async fn stream_ends_when_store_closes() {
    let store: SnapshotStore<String, u32> = SnapshotStore::new("stream");
    store.store("a".to_string(), 1).expect("store");
    let stream = store.subscribe(CancellationToken::new()).into_stream();
    let closer = store.clone();
    let collected = tokio::spawn(async move { stream.map(|s| s.version).collect::<Vec<_>>().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    closer.close();
    let versions = tokio::time::timeout(Duration::from_secs(1), collected)
        .await
        .expect("stream did not end")
        .expect("join");
    assert_eq!(versions.first(), Some(&1));
}
