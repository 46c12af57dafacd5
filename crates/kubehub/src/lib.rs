//! Tollgate kubehub: the closed set of managed kinds and the cluster API seam.
//!
//! [`ClusterApi`] is the only path to the cluster. [`KubeCluster`] backs it
//! with kube-rs; [`MemoryCluster`] is an in-process double with the same
//! optimistic-concurrency rules, used by tests and dry runs.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tollgate_core::{sha256_hex, OwnerRef, SPEC_HASH_ANNOTATION};
use tracing::debug;

mod memory;

pub use memory::{CallCounts, MemoryCluster};

/// Every kind of object the reconciler may create for a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum ManagedKind {
    ServiceAccount,
    ConfigMap,
    Role,
    RoleBinding,
    Deployment,
    DaemonSet,
    Service,
    HorizontalPodAutoscaler,
    PodDisruptionBudget,
}

impl ManagedKind {
    /// All kinds, in apply order: identity and config before workloads, the
    /// workload before anything that targets it.
    pub const ALL: [ManagedKind; 9] = [
        ManagedKind::ServiceAccount,
        ManagedKind::ConfigMap,
        ManagedKind::Role,
        ManagedKind::RoleBinding,
        ManagedKind::Deployment,
        ManagedKind::DaemonSet,
        ManagedKind::Service,
        ManagedKind::HorizontalPodAutoscaler,
        ManagedKind::PodDisruptionBudget,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ManagedKind::ServiceAccount => "ServiceAccount",
            ManagedKind::ConfigMap => "ConfigMap",
            ManagedKind::Role => "Role",
            ManagedKind::RoleBinding => "RoleBinding",
            ManagedKind::Deployment => "Deployment",
            ManagedKind::DaemonSet => "DaemonSet",
            ManagedKind::Service => "Service",
            ManagedKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ManagedKind::PodDisruptionBudget => "PodDisruptionBudget",
        }
    }

    pub fn is_workload(self) -> bool {
        matches!(self, ManagedKind::Deployment | ManagedKind::DaemonSet)
    }
}

impl std::fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// A fully specified object of one managed kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ManagedObject {
    ServiceAccount(ServiceAccount),
    ConfigMap(ConfigMap),
    Role(Role),
    RoleBinding(RoleBinding),
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    Service(Service),
    HorizontalPodAutoscaler(HorizontalPodAutoscaler),
    PodDisruptionBudget(PodDisruptionBudget),
}

/// Bind `$o` to the inner typed object and `$wrap` to its variant constructor.
macro_rules! with_object {
    ($obj:expr, |$o:ident, $wrap:ident| $body:expr) => {
        match $obj {
            ManagedObject::ServiceAccount($o) => { let $wrap = ManagedObject::ServiceAccount; $body }
            ManagedObject::ConfigMap($o) => { let $wrap = ManagedObject::ConfigMap; $body }
            ManagedObject::Role($o) => { let $wrap = ManagedObject::Role; $body }
            ManagedObject::RoleBinding($o) => { let $wrap = ManagedObject::RoleBinding; $body }
            ManagedObject::Deployment($o) => { let $wrap = ManagedObject::Deployment; $body }
            ManagedObject::DaemonSet($o) => { let $wrap = ManagedObject::DaemonSet; $body }
            ManagedObject::Service($o) => { let $wrap = ManagedObject::Service; $body }
            ManagedObject::HorizontalPodAutoscaler($o) => { let $wrap = ManagedObject::HorizontalPodAutoscaler; $body }
            ManagedObject::PodDisruptionBudget($o) => { let $wrap = ManagedObject::PodDisruptionBudget; $body }
        }
    };
}

/// Bind the type alias `$t` and variant constructor `$wrap` for a kind.
macro_rules! with_kind {
    ($kind:expr, |$t:ident, $wrap:ident| $body:expr) => {
        match $kind {
            ManagedKind::ServiceAccount => { type $t = ServiceAccount; let $wrap = ManagedObject::ServiceAccount; $body }
            ManagedKind::ConfigMap => { type $t = ConfigMap; let $wrap = ManagedObject::ConfigMap; $body }
            ManagedKind::Role => { type $t = Role; let $wrap = ManagedObject::Role; $body }
            ManagedKind::RoleBinding => { type $t = RoleBinding; let $wrap = ManagedObject::RoleBinding; $body }
            ManagedKind::Deployment => { type $t = Deployment; let $wrap = ManagedObject::Deployment; $body }
            ManagedKind::DaemonSet => { type $t = DaemonSet; let $wrap = ManagedObject::DaemonSet; $body }
            ManagedKind::Service => { type $t = Service; let $wrap = ManagedObject::Service; $body }
            ManagedKind::HorizontalPodAutoscaler => { type $t = HorizontalPodAutoscaler; let $wrap = ManagedObject::HorizontalPodAutoscaler; $body }
            ManagedKind::PodDisruptionBudget => { type $t = PodDisruptionBudget; let $wrap = ManagedObject::PodDisruptionBudget; $body }
        }
    };
}

impl ManagedObject {
    pub fn kind(&self) -> ManagedKind {
        match self {
            ManagedObject::ServiceAccount(_) => ManagedKind::ServiceAccount,
            ManagedObject::ConfigMap(_) => ManagedKind::ConfigMap,
            ManagedObject::Role(_) => ManagedKind::Role,
            ManagedObject::RoleBinding(_) => ManagedKind::RoleBinding,
            ManagedObject::Deployment(_) => ManagedKind::Deployment,
            ManagedObject::DaemonSet(_) => ManagedKind::DaemonSet,
            ManagedObject::Service(_) => ManagedKind::Service,
            ManagedObject::HorizontalPodAutoscaler(_) => ManagedKind::HorizontalPodAutoscaler,
            ManagedObject::PodDisruptionBudget(_) => ManagedKind::PodDisruptionBudget,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        with_object!(self, |o, _w| o.meta())
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        with_object!(self, |o, _w| o.meta_mut())
    }

    pub fn key(&self) -> ObjectKey {
        let m = self.meta();
        ObjectKey::new(m.namespace.clone().unwrap_or_default(), m.name.clone().unwrap_or_default())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta().annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.into());
    }

    /// Hash of the object as rendered, ignoring server-assigned identity and
    /// the hash annotation itself.
    pub fn spec_hash(&self) -> String {
        let mut canon = self.clone();
        let meta = canon.meta_mut();
        meta.resource_version = None;
        meta.uid = None;
        if let Some(a) = meta.annotations.as_mut() {
            a.remove(SPEC_HASH_ANNOTATION);
            if a.is_empty() {
                meta.annotations = None;
            }
        }
        // BTreeMap-backed fields serialize in a stable order
        let bytes = serde_json::to_vec(&canon).unwrap_or_default();
        sha256_hex(&bytes)
    }

    /// Store `spec_hash()` in the hash annotation.
    pub fn stamp_spec_hash(&mut self) -> String {
        let hash = self.spec_hash();
        self.set_annotation(SPEC_HASH_ANNOTATION, hash.clone());
        hash
    }

    /// Take over the live object's identity so an update is accepted.
    pub fn adopt_identity(&mut self, live: &ManagedObject) {
        let src = live.meta();
        let (uid, rv) = (src.uid.clone(), src.resource_version.clone());
        let meta = self.meta_mut();
        meta.uid = uid;
        meta.resource_version = rv;
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound(_)) }

    /// Errors that a re-fetch and retry can resolve.
    pub fn is_conflict(&self) -> bool { matches!(self, ClusterError::Conflict(_) | ClusterError::AlreadyExists(_)) }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => ClusterError::AlreadyExists(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message),
            kube::Error::Api(ae) => ClusterError::Api { code: ae.code, message: ae.message },
            other => ClusterError::Transport(other.to_string()),
        }
    }
}

/// Create/get/update/delete by key with optimistic concurrency.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, kind: ManagedKind, key: &ObjectKey) -> Result<Option<ManagedObject>, ClusterError>;

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, ClusterError>;

    /// Replace an existing object. `obj` must carry the live resourceVersion,
    /// otherwise the call fails with [`ClusterError::Conflict`].
    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, ClusterError>;

    async fn delete(&self, kind: ManagedKind, key: &ObjectKey) -> Result<(), ClusterError>;

    /// UID of an arbitrary (possibly unmanaged) owner object, if it exists.
    async fn get_uid(&self, owner: &OwnerRef) -> Result<Option<String>, ClusterError>;
}

/// [`ClusterApi`] over a kube-rs client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<&str, ClusterError> {
    obj.meta().namespace.as_deref().ok_or_else(|| ClusterError::Invalid("object has no namespace".into()))
}

fn name_of<K: Resource>(obj: &K) -> Result<&str, ClusterError> {
    obj.meta().name.as_deref().ok_or_else(|| ClusterError::Invalid("object has no name".into()))
}

async fn get_typed<K>(client: &Client, key: &ObjectKey) -> Result<Option<K>, ClusterError>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), &key.namespace);
    Ok(api.get_opt(&key.name).await?)
}

async fn create_typed<K>(client: &Client, obj: &K) -> Result<K, ClusterError>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace_of(obj)?);
    Ok(api.create(&PostParams::default(), obj).await?)
}

async fn replace_typed<K>(client: &Client, obj: &K) -> Result<K, ClusterError>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace_of(obj)?);
    Ok(api.replace(name_of(obj)?, &PostParams::default(), obj).await?)
}

async fn delete_typed<K>(client: &Client, key: &ObjectKey) -> Result<(), ClusterError>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), &key.namespace);
    api.delete(&key.name, &DeleteParams::background()).await?;
    Ok(())
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn get(&self, kind: ManagedKind, key: &ObjectKey) -> Result<Option<ManagedObject>, ClusterError> {
        with_kind!(kind, |K, wrap| Ok(get_typed::<K>(&self.client, key).await?.map(wrap)))
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, ClusterError> {
        debug!(kind = %obj.kind(), key = %obj.key(), "create");
        with_object!(obj, |o, wrap| Ok(wrap(create_typed(&self.client, o).await?)))
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, ClusterError> {
        debug!(kind = %obj.kind(), key = %obj.key(), rv = ?obj.meta().resource_version, "replace");
        with_object!(obj, |o, wrap| Ok(wrap(replace_typed(&self.client, o).await?)))
    }

    async fn delete(&self, kind: ManagedKind, key: &ObjectKey) -> Result<(), ClusterError> {
        debug!(kind = %kind, key = %key, "delete");
        with_kind!(kind, |K, _wrap| delete_typed::<K>(&self.client, key).await)
    }

    async fn get_uid(&self, owner: &OwnerRef) -> Result<Option<String>, ClusterError> {
        let (group, version) = split_api_version(&owner.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &owner.kind);
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = match owner.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api.get_opt(&owner.name).await?.and_then(|o| o.metadata.uid))
    }
}
