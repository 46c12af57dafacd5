//! Tollgate core types: the proxy infra IR consumed by the reconciler, owner
//! references, label conventions and server configuration.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod naming;

pub use naming::{hashed_name, sha256_hex, DNS1123_LABEL_MAX, DNS1123_SUBDOMAIN_MAX};

/// Prefix of every managed resource name.
pub const RESOURCE_PREFIX: &str = "tollgate";

pub const OWNING_GATEWAY_NAME_LABEL: &str = "tollgate.io/owning-gateway-name";
pub const OWNING_GATEWAY_NAMESPACE_LABEL: &str = "tollgate.io/owning-gateway-namespace";
pub const OWNING_GATEWAY_CLASS_LABEL: &str = "tollgate.io/owning-gatewayclass";

/// Annotation carrying the hash of the last written desired object.
pub const SPEC_HASH_ANNOTATION: &str = "tollgate.io/spec-hash";

pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
pub const APP_COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Name shared by every object of the global rate-limit service.
pub const RATE_LIMIT_NAME: &str = "tollgate-ratelimit";

pub type Labels = BTreeMap<String, String>;

/// Labels carried by every managed proxy resource.
pub fn app_labels() -> Labels {
    [
        (APP_NAME_LABEL, "tollgate-proxy"),
        (APP_COMPONENT_LABEL, "proxy"),
        (APP_MANAGED_BY_LABEL, "tollgate"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Labels carried by every rate-limit resource; also its workload selector.
pub fn rate_limit_labels() -> Labels {
    [
        (APP_NAME_LABEL, RATE_LIMIT_NAME),
        (APP_COMPONENT_LABEL, "ratelimit"),
        (APP_MANAGED_BY_LABEL, "tollgate"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// True when labels do not identify an owning gateway (name + namespace) or
/// an owning gateway class.
pub fn owning_labels_absent(labels: &Labels) -> bool {
    let present = |k: &str| labels.get(k).map(|v| !v.is_empty()).unwrap_or(false);
    (!present(OWNING_GATEWAY_NAME_LABEL) || !present(OWNING_GATEWAY_NAMESPACE_LABEL))
        && !present(OWNING_GATEWAY_CLASS_LABEL)
}

/// Whether an owning label participates in the workload selector.
pub fn is_owning_label(key: &str) -> bool {
    matches!(
        key,
        OWNING_GATEWAY_NAME_LABEL | OWNING_GATEWAY_NAMESPACE_LABEL | OWNING_GATEWAY_CLASS_LABEL
    )
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IrError {
    #[error("infra ir is missing a name")]
    MissingName,
    #[error("infra ir {0} is missing a target namespace")]
    MissingNamespace(String),
    #[error("infra ir {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Reference to the object owning a proxy's managed resources.
///
/// `uid` is resolved from the cluster before rendering; the reconciler never
/// invents one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl OwnerRef {
    pub fn with_uid(&self, uid: impl Into<String>) -> Self {
        Self { uid: Some(uid.into()), ..self.clone() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InfraMetadata {
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_reference: Option<OwnerRef>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Https,
    Tls,
    Tcp,
    Udp,
}

impl Protocol {
    /// Transport protocol used by the exposing service.
    pub fn transport(self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            _ => "TCP",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerPort {
    pub name: String,
    pub protocol: Protocol,
    pub service_port: i32,
    pub container_port: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyListener {
    pub name: String,
    #[serde(default)]
    pub ports: SmallVec<[ListenerPort; 2]>,
    /// Also expose HTTPS ports over UDP for HTTP/3.
    #[serde(default)]
    pub http3: bool,
}

/// Compute resources for the proxy container, as Kubernetes quantity strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    DaemonSet,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceType {
    ClusterIP,
    NodePort,
    #[default]
    LoadBalancer,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExternalTrafficPolicy {
    #[default]
    Local,
    Cluster,
}

impl ExternalTrafficPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExternalTrafficPolicy::Local => "Local",
            ExternalTrafficPolicy::Cluster => "Cluster",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub external_traffic_policy: ExternalTrafficPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cpu_utilization: Option<i32>,
}

/// Either bound may be an absolute count ("1") or a percentage ("50%").
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<String>,
}

/// Optional features; each one may require extra managed resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggles {
    /// Grants the proxy read access to pods and endpoint slices (Role + RoleBinding).
    #[serde(default)]
    pub pod_introspection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<AutoscalingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disruption_budget: Option<DisruptionBudgetConfig>,
    #[serde(default = "default_true")]
    pub prometheus: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self { pod_introspection: false, autoscaling: None, disruption_budget: None, prometheus: true }
    }
}

fn default_true() -> bool { true }

/// Desired state of one managed proxy fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInfra {
    /// Logical name, usually `<gateway-namespace>/<gateway-name>`.
    pub name: String,
    /// Namespace the managed resources live in.
    pub namespace: String,
    #[serde(default)]
    pub metadata: InfraMetadata,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub listeners: Vec<ProxyListener>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub workload: WorkloadKind,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub pod: PodConfig,
    #[serde(default)]
    pub features: FeatureToggles,
    /// Rendered bootstrap configuration, embedded verbatim in the proxy args.
    #[serde(default)]
    pub bootstrap: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String { "warn".to_string() }

impl ProxyInfra {
    /// Minimal IR with the given logical name and target namespace.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            metadata: InfraMetadata::default(),
            image: None,
            replicas: None,
            resources: None,
            listeners: Vec::new(),
            addresses: Vec::new(),
            workload: WorkloadKind::default(),
            service: ServiceConfig::default(),
            pod: PodConfig::default(),
            features: FeatureToggles::default(),
            bootstrap: String::new(),
            log_level: default_log_level(),
        }
    }

    pub fn validate(&self) -> Result<(), IrError> {
        if self.name.trim().is_empty() {
            return Err(IrError::MissingName);
        }
        if self.namespace.trim().is_empty() {
            return Err(IrError::MissingNamespace(self.name.clone()));
        }
        if let Some(a) = &self.features.autoscaling {
            if a.max_replicas < a.min_replicas.unwrap_or(1) {
                return Err(IrError::Invalid {
                    name: self.name.clone(),
                    reason: format!("autoscaling maxReplicas {} below minReplicas", a.max_replicas),
                });
            }
        }
        Ok(())
    }
}

/// Desired state of the global rate-limit service shared by every proxy.
///
/// There is at most one per controller; its objects all carry
/// [`RATE_LIMIT_NAME`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfra {
    /// Namespace the rate-limit resources live in; filled from the
    /// controller namespace when empty.
    #[serde(default)]
    pub namespace: String,
    /// Redis URL of the counter backend, e.g. `redis.infra.svc:6379`.
    pub backend_url: String,
    #[serde(default)]
    pub metadata: InfraMetadata,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<AutoscalingConfig>,
    /// Export counters through a statsd-to-Prometheus sidecar.
    #[serde(default = "default_true")]
    pub prometheus: bool,
    #[serde(default = "default_rate_limit_log_level")]
    pub log_level: String,
}

fn default_rate_limit_log_level() -> String { "info".to_string() }

impl RateLimitInfra {
    pub fn new(namespace: impl Into<String>, backend_url: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            backend_url: backend_url.into(),
            metadata: InfraMetadata::default(),
            image: None,
            replicas: None,
            resources: None,
            autoscaling: None,
            prometheus: true,
            log_level: default_rate_limit_log_level(),
        }
    }

    pub fn name(&self) -> &str { RATE_LIMIT_NAME }

    pub fn validate(&self) -> Result<(), IrError> {
        if self.namespace.trim().is_empty() {
            return Err(IrError::MissingNamespace(RATE_LIMIT_NAME.to_string()));
        }
        if self.backend_url.trim().is_empty() {
            return Err(IrError::Invalid { name: RATE_LIMIT_NAME.to_string(), reason: "missing backend url".to_string() });
        }
        if let Some(a) = &self.autoscaling {
            if a.max_replicas < a.min_replicas.unwrap_or(1) {
                return Err(IrError::Invalid {
                    name: RATE_LIMIT_NAME.to_string(),
                    reason: format!("autoscaling maxReplicas {} below minReplicas", a.max_replicas),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, initial_backoff_ms: 10, max_backoff_ms: 1_000, factor: 2 }
    }
}

/// Process-wide settings shared by runners and the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub controller_namespace: String,
    pub dns_domain: String,
    pub default_proxy_image: String,
    pub default_rate_limit_image: String,
    /// Global rate-limit service; absent disables it and removes its objects.
    pub rate_limit: Option<RateLimitInfra>,
    /// Full re-reconcile period of the infrastructure runner; 0 disables it.
    pub resync_interval_secs: u64,
    pub retry: RetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            controller_namespace: "tollgate-system".to_string(),
            dns_domain: "cluster.local".to_string(),
            default_proxy_image: "docker.io/envoyproxy/envoy:distroless-v1.31.0".to_string(),
            default_rate_limit_image: "docker.io/envoyproxy/ratelimit:49af5cca".to_string(),
            rate_limit: None,
            resync_interval_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

pub mod prelude {
    pub use super::{
        hashed_name, OwnerRef, ProxyInfra, ProxyListener, ListenerPort, Protocol, ServerConfig, WorkloadKind,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn owning_labels_need_gateway_pair_or_class() {
        assert!(owning_labels_absent(&Labels::new()));
        assert!(owning_labels_absent(&owned(&[(OWNING_GATEWAY_NAME_LABEL, "gw")])));
        assert!(!owning_labels_absent(&owned(&[
            (OWNING_GATEWAY_NAME_LABEL, "gw"),
            (OWNING_GATEWAY_NAMESPACE_LABEL, "default"),
        ])));
        assert!(!owning_labels_absent(&owned(&[(OWNING_GATEWAY_CLASS_LABEL, "eg")])));
        assert!(owning_labels_absent(&owned(&[(OWNING_GATEWAY_CLASS_LABEL, "")])));
    }

    #[test]
    fn validate_rejects_missing_identity() {
        assert_eq!(ProxyInfra::new("", "ns").validate(), Err(IrError::MissingName));
        assert_eq!(
            ProxyInfra::new("default/gw", " ").validate(),
            Err(IrError::MissingNamespace("default/gw".into()))
        );
        assert!(ProxyInfra::new("default/gw", "tollgate-system").validate().is_ok());
    }

    #[test]
    fn ir_deserializes_with_defaults() {
        let yaml = r#"
name: default/gw
namespace: tollgate-system
metadata:
  labels:
    tollgate.io/owning-gatewayclass: eg
listeners:
  - name: http
    ports:
      - name: http-80
        protocol: HTTP
        servicePort: 80
        containerPort: 10080
"#;
        let infra: ProxyInfra = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(infra.workload, WorkloadKind::Deployment);
        assert_eq!(infra.listeners[0].ports[0].container_port, 10080);
        assert!(infra.features.prometheus);
        assert_eq!(infra.log_level, "warn");
    }

    #[test]
    fn server_config_partial_yaml_keeps_defaults() {
        let cfg: ServerConfig = serde_yaml::from_str("dnsDomain: corp.local\nretry:\n  maxAttempts: 3\n").expect("parse");
        assert_eq!(cfg.dns_domain, "corp.local");
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.initial_backoff_ms, 10);
        assert_eq!(cfg.controller_namespace, "tollgate-system");
        assert_eq!(cfg.rate_limit, None);
    }

    #[test]
    fn rate_limit_config_needs_a_backend() {
        let cfg: ServerConfig = serde_yaml::from_str("rateLimit:\n  backendUrl: redis.infra.svc:6379\n").expect("parse");
        let rl = cfg.rate_limit.expect("rate limit");
        assert!(rl.prometheus);
        assert_eq!(rl.log_level, "info");
        assert_eq!(rl.validate(), Err(IrError::MissingNamespace(RATE_LIMIT_NAME.into())));

        let rl = RateLimitInfra { namespace: "tollgate-system".into(), ..rl };
        assert!(rl.validate().is_ok());
        assert!(matches!(RateLimitInfra::new("tollgate-system", " ").validate(), Err(IrError::Invalid { .. })));
    }
}
