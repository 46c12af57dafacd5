//! Tollgate render: computes the exact set of Kubernetes objects a proxy
//! fleet needs from its [`ProxyInfra`] description, and those of the global
//! rate-limit service from its [`tollgate_core::RateLimitInfra`].
//!
//! Rendering is pure. The same IR, owners and server config always produce
//! identical objects: maps are `BTreeMap`s and every list follows declaration
//! order or a fixed order.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use tollgate_core::{
    app_labels, hashed_name, is_owning_label, owning_labels_absent, AutoscalingConfig, Labels, OwnerRef, ProxyInfra,
    ServerConfig, WorkloadKind, DNS1123_LABEL_MAX, RESOURCE_PREFIX,
};
use tollgate_kubehub::{ManagedKind, ManagedObject};

mod ratelimit;
mod service;
mod workload;

pub use ratelimit::{RateLimitRender, RATE_LIMIT_CONTAINER, RATE_LIMIT_GRPC_PORT, STATSD_EXPORTER_CONTAINER};
pub use workload::{PROXY_CONTAINER, READINESS_PORT, STATS_PORT};

pub const SDS_CA_FILE: &str = "xds-trusted-ca.json";
pub const SDS_CERT_FILE: &str = "xds-certificate.json";
/// Secret holding the proxy's xDS client certificate, created by the installer.
pub const XDS_CERT_SECRET: &str = "tollgate-proxy-certs";

const CERTS_DIR: &str = "/certs";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("{name}: missing owning gateway labels")]
    MissingRequiredLabel { name: String },
    #[error("{name}: owner {kind}/{owner} has no resolved uid")]
    UnresolvedOwner { name: String, kind: String, owner: String },
    #[error("{name}: {kind} is not enabled")]
    NotEnabled { name: String, kind: ManagedKind },
}

/// Renders the managed objects of one logical object. Every object shares
/// [`Render::name`] so it can be found and deleted by kind alone.
pub trait Render: Send + Sync {
    fn name(&self) -> String;

    fn namespace(&self) -> &str;

    /// Every kind this renderer may ever produce, in apply order.
    fn managed_kinds(&self) -> &'static [ManagedKind] { &ManagedKind::ALL }

    /// Whether the current configuration needs `kind`.
    fn requires(&self, kind: ManagedKind) -> bool;

    /// Render one kind, whether or not the current configuration needs it.
    fn render(&self, kind: ManagedKind) -> Result<ManagedObject, RenderError>;

    fn required_kinds(&self) -> Vec<ManagedKind> {
        self.managed_kinds().iter().copied().filter(|k| self.requires(*k)).collect()
    }

    fn render_all(&self) -> Result<ManagedResourceSet, RenderError> {
        let objects = self.required_kinds().into_iter().map(|k| self.render(k)).collect::<Result<Vec<_>, _>>()?;
        Ok(ManagedResourceSet { name: self.name(), namespace: self.namespace().to_string(), objects })
    }
}

/// Renders the managed objects of one proxy.
pub struct ResourceRender<'a> {
    infra: &'a ProxyInfra,
    owners: Vec<OwnerRef>,
    config: &'a ServerConfig,
}

impl<'a> ResourceRender<'a> {
    /// `owners` must carry resolved UIDs; they are copied onto every object.
    pub fn new(infra: &'a ProxyInfra, owners: Vec<OwnerRef>, config: &'a ServerConfig) -> Self {
        Self { infra, owners, config }
    }

    pub fn infra(&self) -> &ProxyInfra { self.infra }

    /// App labels overlaid with the IR labels. Fails without owning labels.
    pub fn labels(&self) -> Result<Labels, RenderError> {
        let mut labels = app_labels();
        labels.extend(self.infra.metadata.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        if owning_labels_absent(&labels) {
            return Err(RenderError::MissingRequiredLabel { name: self.infra.name.clone() });
        }
        Ok(labels)
    }

    /// Pod template labels: resource labels plus pod-only labels.
    pub fn pod_labels(&self) -> Result<Labels, RenderError> {
        let mut labels = self.labels()?;
        labels.extend(self.infra.pod.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(labels)
    }

    /// Selector built from app and owning labels only, so custom label edits
    /// never touch the immutable workload selector.
    pub fn stable_selector(&self) -> LabelSelector {
        let mut labels = app_labels();
        labels.extend(
            self.infra
                .metadata
                .labels
                .iter()
                .filter(|(k, _)| is_owning_label(k))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        LabelSelector { match_labels: Some(labels), match_expressions: None }
    }

    pub fn owner_references(&self) -> Result<Vec<OwnerReference>, RenderError> {
        owner_references(&self.infra.name, &self.owners)
    }

    fn annotations(&self) -> Option<BTreeMap<String, String>> {
        non_empty(self.infra.metadata.annotations.clone())
    }

    fn object_meta(&self, labels: Labels) -> Result<ObjectMeta, RenderError> {
        let owners = self.owner_references()?;
        Ok(ObjectMeta {
            name: Some(self.name()),
            namespace: Some(self.infra.namespace.clone()),
            labels: non_empty(labels),
            annotations: self.annotations(),
            owner_references: if owners.is_empty() { None } else { Some(owners) },
            ..Default::default()
        })
    }

    fn autoscaled(&self) -> bool {
        self.infra.workload == WorkloadKind::Deployment && self.infra.features.autoscaling.is_some()
    }

    fn not_enabled(&self, kind: ManagedKind) -> RenderError {
        RenderError::NotEnabled { name: self.infra.name.clone(), kind }
    }

    pub fn service_account(&self) -> Result<ServiceAccount, RenderError> {
        Ok(ServiceAccount { metadata: self.object_meta(self.labels()?)?, ..Default::default() })
    }

    /// SDS documents pointing the proxy at its mounted xDS certificates.
    pub fn config_map(&self) -> Result<ConfigMap, RenderError> {
        let data = BTreeMap::from([
            (SDS_CA_FILE.to_string(), sds_trusted_ca(&format!("{CERTS_DIR}/ca.crt"))),
            (
                SDS_CERT_FILE.to_string(),
                sds_certificate(&format!("{CERTS_DIR}/tls.crt"), &format!("{CERTS_DIR}/tls.key")),
            ),
        ]);
        Ok(ConfigMap { metadata: self.object_meta(self.labels()?)?, data: Some(data), ..Default::default() })
    }

    pub fn role(&self) -> Result<Role, RenderError> {
        if !self.requires(ManagedKind::Role) {
            return Err(self.not_enabled(ManagedKind::Role));
        }
        let read = || vec!["get".to_string(), "list".to_string(), "watch".to_string()];
        Ok(Role {
            metadata: self.object_meta(self.labels()?)?,
            rules: Some(vec![
                PolicyRule {
                    api_groups: Some(vec![String::new()]),
                    resources: Some(vec!["pods".to_string()]),
                    verbs: read(),
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec!["discovery.k8s.io".to_string()]),
                    resources: Some(vec!["endpointslices".to_string()]),
                    verbs: read(),
                    ..Default::default()
                },
            ]),
        })
    }

    pub fn role_binding(&self) -> Result<RoleBinding, RenderError> {
        if !self.requires(ManagedKind::RoleBinding) {
            return Err(self.not_enabled(ManagedKind::RoleBinding));
        }
        let name = self.name();
        Ok(RoleBinding {
            metadata: self.object_meta(self.labels()?)?,
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name,
                namespace: Some(self.infra.namespace.clone()),
                ..Default::default()
            }]),
        })
    }

    pub fn horizontal_pod_autoscaler(&self) -> Result<HorizontalPodAutoscaler, RenderError> {
        let cfg = match (&self.infra.features.autoscaling, self.autoscaled()) {
            (Some(cfg), true) => cfg,
            _ => return Err(self.not_enabled(ManagedKind::HorizontalPodAutoscaler)),
        };
        Ok(HorizontalPodAutoscaler {
            metadata: self.object_meta(self.labels()?)?,
            spec: Some(autoscaler_spec(cfg, self.name())),
            ..Default::default()
        })
    }

    pub fn pod_disruption_budget(&self) -> Result<PodDisruptionBudget, RenderError> {
        let cfg = self
            .infra
            .features
            .disruption_budget
            .as_ref()
            .ok_or_else(|| self.not_enabled(ManagedKind::PodDisruptionBudget))?;
        let mut spec = PodDisruptionBudgetSpec { selector: Some(self.stable_selector()), ..Default::default() };
        match (&cfg.min_available, &cfg.max_unavailable) {
            (Some(min), _) => spec.min_available = Some(int_or_percent(min)),
            (None, Some(max)) => spec.max_unavailable = Some(int_or_percent(max)),
            (None, None) => spec.min_available = Some(IntOrString::Int(0)),
        }
        Ok(PodDisruptionBudget {
            metadata: self.object_meta(self.labels()?)?,
            spec: Some(spec),
            ..Default::default()
        })
    }
}

impl Render for ResourceRender<'_> {
    fn name(&self) -> String { hashed_name(RESOURCE_PREFIX, &self.infra.name, DNS1123_LABEL_MAX) }

    fn namespace(&self) -> &str { &self.infra.namespace }

    fn requires(&self, kind: ManagedKind) -> bool {
        let f = &self.infra.features;
        match kind {
            ManagedKind::ServiceAccount | ManagedKind::ConfigMap | ManagedKind::Service => true,
            ManagedKind::Role | ManagedKind::RoleBinding => f.pod_introspection,
            ManagedKind::Deployment => self.infra.workload == WorkloadKind::Deployment,
            ManagedKind::DaemonSet => self.infra.workload == WorkloadKind::DaemonSet,
            ManagedKind::HorizontalPodAutoscaler => self.autoscaled(),
            ManagedKind::PodDisruptionBudget => f.disruption_budget.is_some(),
        }
    }

    fn render(&self, kind: ManagedKind) -> Result<ManagedObject, RenderError> {
        Ok(match kind {
            ManagedKind::ServiceAccount => ManagedObject::ServiceAccount(self.service_account()?),
            ManagedKind::ConfigMap => ManagedObject::ConfigMap(self.config_map()?),
            ManagedKind::Role => ManagedObject::Role(self.role()?),
            ManagedKind::RoleBinding => ManagedObject::RoleBinding(self.role_binding()?),
            ManagedKind::Deployment => ManagedObject::Deployment(self.deployment()?),
            ManagedKind::DaemonSet => ManagedObject::DaemonSet(self.daemon_set()?),
            ManagedKind::Service => ManagedObject::Service(self.service()?),
            ManagedKind::HorizontalPodAutoscaler => ManagedObject::HorizontalPodAutoscaler(self.horizontal_pod_autoscaler()?),
            ManagedKind::PodDisruptionBudget => ManagedObject::PodDisruptionBudget(self.pod_disruption_budget()?),
        })
    }
}

/// The objects required by one logical object, in apply order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedResourceSet {
    pub name: String,
    pub namespace: String,
    pub objects: Vec<ManagedObject>,
}

impl ManagedResourceSet {
    pub fn kinds(&self) -> Vec<ManagedKind> { self.objects.iter().map(ManagedObject::kind).collect() }

    pub fn get(&self, kind: ManagedKind) -> Option<&ManagedObject> { self.objects.iter().find(|o| o.kind() == kind) }

    pub fn len(&self) -> usize { self.objects.len() }

    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, ManagedObject> { self.objects.iter() }
}

impl IntoIterator for ManagedResourceSet {
    type Item = ManagedObject;
    type IntoIter = std::vec::IntoIter<ManagedObject>;

    fn into_iter(self) -> Self::IntoIter { self.objects.into_iter() }
}

/// Scales the Deployment named `target` on CPU utilization when a target is set.
fn autoscaler_spec(cfg: &AutoscalingConfig, target: String) -> HorizontalPodAutoscalerSpec {
    let metrics = cfg.target_cpu_utilization.map(|pct| {
        vec![MetricSpec {
            type_: "Resource".to_string(),
            resource: Some(ResourceMetricSource {
                name: "cpu".to_string(),
                target: MetricTarget { type_: "Utilization".to_string(), average_utilization: Some(pct), ..Default::default() },
            }),
            ..Default::default()
        }]
    });
    HorizontalPodAutoscalerSpec {
        scale_target_ref: CrossVersionObjectReference {
            api_version: Some("apps/v1".to_string()),
            kind: "Deployment".to_string(),
            name: target,
        },
        min_replicas: cfg.min_replicas,
        max_replicas: cfg.max_replicas,
        metrics,
        behavior: None,
    }
}

fn owner_references(name: &str, owners: &[OwnerRef]) -> Result<Vec<OwnerReference>, RenderError> {
    owners
        .iter()
        .map(|o| match &o.uid {
            Some(uid) => Ok(OwnerReference {
                api_version: o.api_version.clone(),
                kind: o.kind.clone(),
                name: o.name.clone(),
                uid: uid.clone(),
                ..Default::default()
            }),
            None => Err(RenderError::UnresolvedOwner { name: name.to_string(), kind: o.kind.clone(), owner: o.name.clone() }),
        })
        .collect()
}

fn non_empty<K, V>(m: BTreeMap<K, V>) -> Option<BTreeMap<K, V>> {
    if m.is_empty() { None } else { Some(m) }
}

/// "25%" stays a string, "3" becomes an integer.
fn int_or_percent(v: &str) -> IntOrString {
    match v.trim().parse::<i32>() {
        Ok(n) => IntOrString::Int(n),
        Err(_) => IntOrString::String(v.trim().to_string()),
    }
}

fn sds_trusted_ca(ca_path: &str) -> String {
    serde_json::json!({
        "resources": [{
            "@type": "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret",
            "name": "xds_trusted_ca",
            "validation_context": { "trusted_ca": { "filename": ca_path } }
        }]
    })
    .to_string()
}

fn sds_certificate(cert_path: &str, key_path: &str) -> String {
    serde_json::json!({
        "resources": [{
            "@type": "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret",
            "name": "xds_certificate",
            "tls_certificate": {
                "certificate_chain": { "filename": cert_path },
                "private_key": { "filename": key_path }
            }
        }]
    })
    .to_string()
}

#[cfg(test)]
mod tests;
