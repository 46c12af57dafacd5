//! Tollgate store: versioned key/value snapshots with change notification.
//!
//! Writers publish a complete new [`Snapshot`] per change; readers subscribe
//! and always receive the newest snapshot, so slow consumers coalesce bursts
//! instead of queueing them.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use futures::Stream;
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("snapshot store {0} is closed")]
    Closed(String),
}

/// Immutable state of a store at one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<K, V> {
    pub version: u64,
    pub state: BTreeMap<K, V>,
}

impl<K, V> Default for Snapshot<K, V> {
    fn default() -> Self { Self { version: 0, state: BTreeMap::new() } }
}

impl<K: Ord + Clone, V: Clone + PartialEq> Snapshot<K, V> {
    /// Per-key changes that turn `prev` into `self`. Deletes carry the last
    /// value seen in `prev`.
    pub fn changes_since(&self, prev: Option<&Snapshot<K, V>>) -> Vec<Update<K, V>> {
        let empty = BTreeMap::new();
        let before = prev.map(|p| &p.state).unwrap_or(&empty);
        let mut out = Vec::new();
        for (k, v) in &self.state {
            if before.get(k) != Some(v) {
                out.push(Update::upsert(k.clone(), v.clone()));
            }
        }
        for (k, v) in before {
            if !self.state.contains_key(k) {
                out.push(Update { key: k.clone(), value: Some(v.clone()), is_delete: true });
            }
        }
        out
    }
}

impl<K: Ord, V> Snapshot<K, V> {
    pub fn get(&self, key: &K) -> Option<&V> { self.state.get(key) }
    pub fn len(&self) -> usize { self.state.len() }
    pub fn is_empty(&self) -> bool { self.state.is_empty() }
}

/// A single change applied to a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update<K, V> {
    pub key: K,
    pub value: Option<V>,
    pub is_delete: bool,
}

impl<K, V> Update<K, V> {
    pub fn upsert(key: K, value: V) -> Self { Self { key, value: Some(value), is_delete: false } }
    pub fn delete(key: K) -> Self { Self { key, value: None, is_delete: true } }
}

struct Inner<K, V> {
    name: String,
    /// Guards mutation + publication; holds the closed flag.
    writer: Mutex<bool>,
    current: ArcSwap<Snapshot<K, V>>,
    version_tx: watch::Sender<u64>,
    closed: CancellationToken,
}

/// Concurrency-safe versioned map. Cloning yields another handle to the same store.
pub struct SnapshotStore<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for SnapshotStore<K, V> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K, V> Debug for SnapshotStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("name", &self.inner.name)
            .field("version", &self.inner.current.load().version)
            .finish()
    }
}

impl<K, V> SnapshotStore<K, V>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        let (version_tx, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                writer: Mutex::new(false),
                current: ArcSwap::from_pointee(Snapshot::default()),
                version_tx,
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    /// Latest published snapshot (lock-free).
    pub fn current(&self) -> Arc<Snapshot<K, V>> { self.inner.current.load_full() }

    pub fn version(&self) -> u64 { self.inner.current.load().version }

    pub fn len(&self) -> usize { self.inner.current.load().state.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn get(&self, key: &K) -> Option<V> { self.inner.current.load().state.get(key).cloned() }

    pub fn is_closed(&self) -> bool { self.inner.closed.is_cancelled() }

    /// Upsert `key` and publish. Returns the new version.
    pub fn store(&self, key: K, value: V) -> Result<u64, StoreError> {
        self.publish(|state| {
            state.insert(key, value);
        })
    }

    /// Remove `key` and publish; still bumps the version when the key is absent.
    pub fn delete(&self, key: &K) -> Result<u64, StoreError> {
        self.publish(|state| {
            state.remove(key);
        })
    }

    pub fn apply(&self, update: Update<K, V>) -> Result<u64, StoreError> {
        match (update.is_delete, update.value) {
            (false, Some(v)) => self.store(update.key, v),
            _ => self.delete(&update.key),
        }
    }

    /// Upsert several entries as a single version.
    pub fn store_all<I>(&self, entries: I) -> Result<u64, StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.publish(|state| state.extend(entries))
    }

    /// Replace the whole state as a single version.
    pub fn replace_all(&self, next: BTreeMap<K, V>) -> Result<u64, StoreError> {
        self.publish(|state| *state = next)
    }

    fn lock_writer(&self) -> MutexGuard<'_, bool> {
        // a panicking writer never leaves the map half-published
        self.inner.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish<F>(&self, mutate: F) -> Result<u64, StoreError>
    where
        F: FnOnce(&mut BTreeMap<K, V>),
    {
        let guard = self.lock_writer();
        if *guard {
            return Err(StoreError::Closed(self.inner.name.clone()));
        }
        let prev = self.inner.current.load_full();
        let mut state = prev.state.clone();
        mutate(&mut state);
        let version = prev.version.saturating_add(1);
        let len = state.len();
        self.inner.current.store(Arc::new(Snapshot { version, state }));
        self.inner.version_tx.send_replace(version);
        drop(guard);

        counter!("snapshot_store_publish_total", 1, "store" => self.inner.name.clone());
        gauge!("snapshot_store_version", version as f64, "store" => self.inner.name.clone());
        debug!(store = %self.inner.name, version, entries = len, "published snapshot");
        Ok(version)
    }

    /// Subscribe to snapshots until `cancel` fires or the store closes.
    pub fn subscribe(&self, cancel: CancellationToken) -> Subscription<K, V> {
        Subscription {
            inner: Arc::clone(&self.inner),
            rx: self.inner.version_tx.subscribe(),
            cancel,
            last_seen: None,
        }
    }

    /// End all subscriptions and reject later writes. Idempotent.
    pub fn close(&self) {
        let mut guard = self.lock_writer();
        if *guard {
            return;
        }
        *guard = true;
        drop(guard);
        self.inner.closed.cancel();
        info!(store = %self.inner.name, "snapshot store closed");
    }
}

/// Per-consumer handle yielding snapshots in strictly increasing version order.
pub struct Subscription<K, V> {
    inner: Arc<Inner<K, V>>,
    rx: watch::Receiver<u64>,
    cancel: CancellationToken,
    last_seen: Option<u64>,
}

impl<K, V> Subscription<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Next snapshot newer than the last one returned. The first call returns
    /// the current snapshot immediately. `None` once cancelled or closed.
    pub async fn recv(&mut self) -> Option<Arc<Snapshot<K, V>>> {
        loop {
            if self.cancel.is_cancelled() || self.inner.closed.is_cancelled() {
                return None;
            }
            // mark before loading so a publish in between still wakes us
            self.rx.borrow_and_update();
            let snap = self.inner.current.load_full();
            if self.last_seen.map_or(true, |seen| snap.version > seen) {
                self.last_seen = Some(snap.version);
                return Some(snap);
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = self.inner.closed.cancelled() => return None,
                res = self.rx.changed() => {
                    if res.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    pub fn last_seen(&self) -> Option<u64> { self.last_seen }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Snapshot<K, V>>> {
        futures::stream::unfold(self, |mut sub| async move {
            let next = sub.recv().await?;
            Some((next, sub))
        })
    }
}
