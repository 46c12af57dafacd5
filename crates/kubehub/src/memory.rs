//! In-process [`ClusterApi`] with resourceVersion checks and fault injection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tollgate_core::OwnerRef;

use crate::{ClusterApi, ClusterError, ManagedKind, ManagedObject, ObjectKey};

/// Successful mutations and rejected updates observed by a [`MemoryCluster`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: u64,
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub conflicts: u64,
}

type Slot = (ManagedKind, String, String);
type OwnerSlot = (String, Option<String>, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Slot, ManagedObject>,
    owners: BTreeMap<OwnerSlot, String>,
    next_rv: u64,
    calls: CallCounts,
    pending_conflicts: u32,
    interfering_gets: u32,
    failing: BTreeMap<ManagedKind, String>,
    failing_deletes: BTreeMap<ManagedKind, String>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

fn slot(kind: ManagedKind, key: &ObjectKey) -> Slot { (kind, key.namespace.clone(), key.name.clone()) }

fn owner_slot(owner: &OwnerRef) -> OwnerSlot { (owner.kind.clone(), owner.namespace.clone(), owner.name.clone()) }

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a panicked test thread must not wedge the others
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make `owner` resolvable through `get_uid`; returns its UID.
    pub fn register_owner(&self, owner: &OwnerRef) -> String {
        let uid = owner.uid.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.lock().owners.insert(owner_slot(owner), uid.clone());
        uid
    }

    pub fn remove_owner(&self, owner: &OwnerRef) { self.lock().owners.remove(&owner_slot(owner)); }

    pub fn object(&self, kind: ManagedKind, namespace: &str, name: &str) -> Option<ManagedObject> {
        self.lock().objects.get(&(kind, namespace.to_string(), name.to_string())).cloned()
    }

    pub fn contains(&self, kind: ManagedKind, namespace: &str, name: &str) -> bool {
        self.object(kind, namespace, name).is_some()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Kinds present in `namespace`, deduplicated and in apply order.
    pub fn kinds_in(&self, namespace: &str) -> Vec<ManagedKind> {
        let st = self.lock();
        let mut kinds: Vec<_> = st.objects.keys().filter(|(_, ns, _)| ns == namespace).map(|(k, _, _)| *k).collect();
        kinds.dedup();
        kinds
    }

    pub fn calls(&self) -> CallCounts { self.lock().calls }

    pub fn reset_calls(&self) { self.lock().calls = CallCounts::default(); }

    /// Reject the next `n` updates with a conflict.
    pub fn inject_conflicts(&self, n: u32) { self.lock().pending_conflicts = n; }

    /// After each of the next `n` successful gets, modify the stored object
    /// as a concurrent writer would.
    pub fn interfere_after_gets(&self, n: u32) { self.lock().interfering_gets = n; }

    /// Fail every create/update of `kind` with a server error.
    pub fn fail_writes(&self, kind: ManagedKind, message: impl Into<String>) {
        self.lock().failing.insert(kind, message.into());
    }

    /// Fail every delete of `kind` with a server error.
    pub fn fail_deletes(&self, kind: ManagedKind, message: impl Into<String>) {
        self.lock().failing_deletes.insert(kind, message.into());
    }

    pub fn clear_failures(&self) {
        let mut st = self.lock();
        st.failing.clear();
        st.failing_deletes.clear();
    }

    /// Place an object directly, bypassing counters and checks.
    pub fn seed(&self, mut obj: ManagedObject) -> ManagedObject {
        let mut st = self.lock();
        let rv = st.bump();
        let meta = obj.meta_mut();
        meta.resource_version = Some(rv);
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        st.objects.insert(slot(obj.kind(), &obj.key()), obj.clone());
        obj
    }

    /// Remove an object out of band, as an operator would.
    pub fn delete_object(&self, kind: ManagedKind, namespace: &str, name: &str) -> Option<ManagedObject> {
        self.lock().objects.remove(&(kind, namespace.to_string(), name.to_string()))
    }

    fn check_failing(failing: &BTreeMap<ManagedKind, String>, kind: ManagedKind) -> Result<(), ClusterError> {
        match failing.get(&kind) {
            Some(msg) => Err(ClusterError::Api { code: 500, message: msg.clone() }),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, kind: ManagedKind, key: &ObjectKey) -> Result<Option<ManagedObject>, ClusterError> {
        let mut st = self.lock();
        st.calls.gets += 1;
        let s = slot(kind, key);
        let found = st.objects.get(&s).cloned();
        if found.is_some() && st.interfering_gets > 0 {
            st.interfering_gets -= 1;
            let rv = st.bump();
            if let Some(obj) = st.objects.get_mut(&s) {
                obj.meta_mut().resource_version = Some(rv);
            }
        }
        Ok(found)
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, ClusterError> {
        let mut st = self.lock();
        Self::check_failing(&st.failing, obj.kind())?;
        let key = obj.key();
        if key.name.is_empty() || key.namespace.is_empty() {
            return Err(ClusterError::Invalid(format!("{} needs a name and namespace", obj.kind())));
        }
        let s = slot(obj.kind(), &key);
        if st.objects.contains_key(&s) {
            st.calls.conflicts += 1;
            return Err(ClusterError::AlreadyExists(format!("{} {}", obj.kind(), key)));
        }
        let mut stored = obj.clone();
        let rv = st.bump();
        let meta = stored.meta_mut();
        meta.resource_version = Some(rv);
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        st.objects.insert(s, stored.clone());
        st.calls.creates += 1;
        Ok(stored)
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, ClusterError> {
        let mut st = self.lock();
        Self::check_failing(&st.failing, obj.kind())?;
        let key = obj.key();
        let s = slot(obj.kind(), &key);
        let live_rv = match st.objects.get(&s) {
            Some(live) => live.meta().resource_version.clone(),
            None => return Err(ClusterError::NotFound(format!("{} {}", obj.kind(), key))),
        };
        if st.pending_conflicts > 0 {
            st.pending_conflicts -= 1;
            st.calls.conflicts += 1;
            return Err(ClusterError::Conflict(format!("{} {}: injected", obj.kind(), key)));
        }
        if obj.meta().resource_version != live_rv {
            st.calls.conflicts += 1;
            return Err(ClusterError::Conflict(format!(
                "{} {}: resourceVersion {:?} is stale (live {:?})",
                obj.kind(),
                key,
                obj.meta().resource_version,
                live_rv
            )));
        }
        let uid = st.objects.get(&s).and_then(|l| l.meta().uid.clone());
        let mut stored = obj.clone();
        let rv = st.bump();
        let meta = stored.meta_mut();
        meta.resource_version = Some(rv);
        meta.uid = uid;
        st.objects.insert(s, stored.clone());
        st.calls.updates += 1;
        Ok(stored)
    }

    async fn delete(&self, kind: ManagedKind, key: &ObjectKey) -> Result<(), ClusterError> {
        let mut st = self.lock();
        Self::check_failing(&st.failing_deletes, kind)?;
        match st.objects.remove(&slot(kind, key)) {
            Some(_) => {
                st.calls.deletes += 1;
                Ok(())
            }
            None => Err(ClusterError::NotFound(format!("{kind} {key}"))),
        }
    }

    async fn get_uid(&self, owner: &OwnerRef) -> Result<Option<String>, ClusterError> {
        Ok(self.lock().owners.get(&owner_slot(owner)).cloned())
    }
}
