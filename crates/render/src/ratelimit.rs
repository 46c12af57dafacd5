//! The global rate-limit service: the rate-limit server, fed its limits over
//! xDS by the controller and its counters by Redis. With Prometheus enabled a
//! statsd exporter sidecar turns its statsd output into scrapeable series.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tollgate_core::{rate_limit_labels, Labels, OwnerRef, RateLimitInfra, ServerConfig, RATE_LIMIT_NAME};
use tollgate_kubehub::{ManagedKind, ManagedObject};

use crate::workload::quantities;
use crate::{autoscaler_spec, non_empty, owner_references, Render, RenderError};

pub const RATE_LIMIT_CONTAINER: &str = "ratelimit";
pub const STATSD_EXPORTER_CONTAINER: &str = "statsd-exporter";
pub const RATE_LIMIT_GRPC_PORT: i32 = 8081;

const STATSD_PORT: i32 = 9125;
const METRICS_PORT: i32 = 19001;
const XDS_PORT: i32 = 18001;
const STATSD_EXPORTER_IMAGE: &str = "docker.io/prom/statsd-exporter:v0.18.0";
const STATSD_CONFIG_FILE: &str = "conf.yaml";
const STATSD_CONFIG_DIR: &str = "/etc/statsd-exporter";
const TERMINATION_GRACE_SECONDS: i64 = 300;
const REVISION_HISTORY: i32 = 10;
const PROGRESS_DEADLINE_SECONDS: i32 = 600;
const FILE_MODE: i32 = 0o644;

const KINDS: [ManagedKind; 5] = [
    ManagedKind::ServiceAccount,
    ManagedKind::ConfigMap,
    ManagedKind::Deployment,
    ManagedKind::Service,
    ManagedKind::HorizontalPodAutoscaler,
];

const STATSD_MAPPINGS: &str = r#"mappings:
  - match: "ratelimit.service.rate_limit.*.*.near_limit"
    name: "ratelimit_service_rate_limit_near_limit"
    timer_type: "histogram"
    labels:
      domain: "$1"
      key1: "$2"
  - match: "ratelimit.service.rate_limit.*.*.over_limit"
    name: "ratelimit_service_rate_limit_over_limit"
    timer_type: "histogram"
    labels:
      domain: "$1"
      key1: "$2"
  - match: "ratelimit.service.rate_limit.*.*.total_hits"
    name: "ratelimit_service_rate_limit_total_hits"
    timer_type: "histogram"
    labels:
      domain: "$1"
      key1: "$2"
  - match: "ratelimit.service.rate_limit.*.*.within_limit"
    name: "ratelimit_service_rate_limit_within_limit"
    timer_type: "histogram"
    labels:
      domain: "$1"
      key1: "$2"
  - match: "ratelimit.service.config_load_success"
    name: "ratelimit_service_config_load_success"
    match_metric_type: counter
  - match: "ratelimit.service.config_load_error"
    name: "ratelimit_service_config_load_error"
    match_metric_type: counter
"#;

/// Renders the objects of the global rate-limit service.
pub struct RateLimitRender<'a> {
    infra: &'a RateLimitInfra,
    owners: Vec<OwnerRef>,
    config: &'a ServerConfig,
}

impl<'a> RateLimitRender<'a> {
    /// `owners` must carry resolved UIDs.
    pub fn new(infra: &'a RateLimitInfra, owners: Vec<OwnerRef>, config: &'a ServerConfig) -> Self {
        Self { infra, owners, config }
    }

    /// User labels under the fixed rate-limit labels, which always win.
    pub fn labels(&self) -> Labels {
        let mut labels = self.infra.metadata.labels.clone();
        labels.extend(rate_limit_labels());
        labels
    }

    pub fn selector(&self) -> LabelSelector {
        LabelSelector { match_labels: Some(rate_limit_labels()), match_expressions: None }
    }

    fn object_meta(&self) -> Result<ObjectMeta, RenderError> {
        let owners = owner_references(RATE_LIMIT_NAME, &self.owners)?;
        Ok(ObjectMeta {
            name: Some(RATE_LIMIT_NAME.to_string()),
            namespace: Some(self.infra.namespace.clone()),
            labels: Some(self.labels()),
            annotations: non_empty(self.infra.metadata.annotations.clone()),
            owner_references: if owners.is_empty() { None } else { Some(owners) },
            ..Default::default()
        })
    }

    fn not_enabled(&self, kind: ManagedKind) -> RenderError {
        RenderError::NotEnabled { name: RATE_LIMIT_NAME.to_string(), kind }
    }

    pub fn service_account(&self) -> Result<ServiceAccount, RenderError> {
        Ok(ServiceAccount { metadata: self.object_meta()?, ..Default::default() })
    }

    /// Statsd-to-Prometheus mappings for the exporter sidecar.
    pub fn config_map(&self) -> Result<ConfigMap, RenderError> {
        if !self.infra.prometheus {
            return Err(self.not_enabled(ManagedKind::ConfigMap));
        }
        Ok(ConfigMap {
            metadata: self.object_meta()?,
            data: Some(BTreeMap::from([(STATSD_CONFIG_FILE.to_string(), STATSD_MAPPINGS.to_string())])),
            ..Default::default()
        })
    }

    pub fn deployment(&self) -> Result<Deployment, RenderError> {
        let replicas = if self.infra.autoscaling.is_some() { None } else { Some(self.infra.replicas.unwrap_or(1)) };
        let mut containers = vec![self.rate_limit_container()];
        let mut volumes = Vec::new();
        if self.infra.prometheus {
            containers.push(statsd_exporter_container());
            volumes.push(Volume {
                name: STATSD_EXPORTER_CONTAINER.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(RATE_LIMIT_NAME.to_string()),
                    default_mode: Some(FILE_MODE),
                    optional: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        Ok(Deployment {
            metadata: self.object_meta()?,
            spec: Some(DeploymentSpec {
                replicas,
                selector: self.selector(),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        annotations: self.pod_annotations(),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers,
                        service_account_name: Some(RATE_LIMIT_NAME.to_string()),
                        automount_service_account_token: Some(false),
                        termination_grace_period_seconds: Some(TERMINATION_GRACE_SECONDS),
                        dns_policy: Some("ClusterFirst".to_string()),
                        restart_policy: Some("Always".to_string()),
                        scheduler_name: Some("default-scheduler".to_string()),
                        volumes: non_empty_vec(volumes),
                        ..Default::default()
                    }),
                },
                revision_history_limit: Some(REVISION_HISTORY),
                progress_deadline_seconds: Some(PROGRESS_DEADLINE_SECONDS),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn pod_annotations(&self) -> Option<BTreeMap<String, String>> {
        let mut a = self.infra.metadata.annotations.clone();
        if self.infra.prometheus {
            a.insert("prometheus.io/path".to_string(), "/metrics".to_string());
            a.insert("prometheus.io/port".to_string(), METRICS_PORT.to_string());
            a.insert("prometheus.io/scrape".to_string(), "true".to_string());
        }
        non_empty(a)
    }

    fn rate_limit_container(&self) -> Container {
        let image = self.infra.image.clone().unwrap_or_else(|| self.config.default_rate_limit_image.clone());
        let var = |name: &str, value: String| EnvVar { name: name.to_string(), value: Some(value), ..Default::default() };
        let mut env = vec![
            var("REDIS_SOCKET_TYPE", "tcp".to_string()),
            var("REDIS_URL", self.infra.backend_url.clone()),
            var("LOG_LEVEL", self.infra.log_level.clone()),
            var("CONFIG_TYPE", "GRPC_XDS_SOTW".to_string()),
            var(
                "CONFIG_GRPC_XDS_SERVER_URL",
                format!("tollgate.{}.svc.{}:{XDS_PORT}", self.config.controller_namespace, self.config.dns_domain),
            ),
            var("CONFIG_GRPC_XDS_NODE_ID", RATE_LIMIT_NAME.to_string()),
            var("USE_STATSD", self.infra.prometheus.to_string()),
        ];
        if self.infra.prometheus {
            env.push(var("STATSD_HOST", "localhost".to_string()));
            env.push(var("STATSD_PORT", STATSD_PORT.to_string()));
        }
        Container {
            name: RATE_LIMIT_CONTAINER.to_string(),
            image: Some(image),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(vec!["/bin/ratelimit".to_string()]),
            env: Some(env),
            ports: Some(vec![ContainerPort {
                name: Some("grpc".to_string()),
                container_port: RATE_LIMIT_GRPC_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: self.infra.resources.as_ref().map(|r| ResourceRequirements {
                requests: non_empty(quantities(&r.requests)),
                limits: non_empty(quantities(&r.limits)),
                ..Default::default()
            }),
            termination_message_path: Some("/dev/termination-log".to_string()),
            termination_message_policy: Some("File".to_string()),
            ..Default::default()
        }
    }

    pub fn service(&self) -> Result<Service, RenderError> {
        let port = |name: &str, port: i32| ServicePort {
            name: Some(name.to_string()),
            protocol: Some("TCP".to_string()),
            port,
            target_port: Some(IntOrString::Int(port)),
            ..Default::default()
        };
        let mut ports = vec![port("grpc", RATE_LIMIT_GRPC_PORT)];
        if self.infra.prometheus {
            ports.push(port("metrics", METRICS_PORT));
        }
        Ok(Service {
            metadata: self.object_meta()?,
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(ports),
                selector: self.selector().match_labels,
                session_affinity: Some("None".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    pub fn horizontal_pod_autoscaler(&self) -> Result<HorizontalPodAutoscaler, RenderError> {
        let cfg = self.infra.autoscaling.as_ref().ok_or_else(|| self.not_enabled(ManagedKind::HorizontalPodAutoscaler))?;
        Ok(HorizontalPodAutoscaler {
            metadata: self.object_meta()?,
            spec: Some(autoscaler_spec(cfg, RATE_LIMIT_NAME.to_string())),
            ..Default::default()
        })
    }
}

fn statsd_exporter_container() -> Container {
    Container {
        name: STATSD_EXPORTER_CONTAINER.to_string(),
        image: Some(STATSD_EXPORTER_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![
            format!("--statsd.mapping-config={STATSD_CONFIG_DIR}/{STATSD_CONFIG_FILE}"),
            format!("--statsd.listen-udp=:{STATSD_PORT}"),
            format!("--statsd.listen-tcp=:{STATSD_PORT}"),
            format!("--web.listen-address=:{METRICS_PORT}"),
            "--web.telemetry-path=/metrics".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: STATSD_EXPORTER_CONTAINER.to_string(),
            mount_path: STATSD_CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    }
}

fn non_empty_vec<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() { None } else { Some(v) }
}

impl Render for RateLimitRender<'_> {
    fn name(&self) -> String { RATE_LIMIT_NAME.to_string() }

    fn namespace(&self) -> &str { &self.infra.namespace }

    fn managed_kinds(&self) -> &'static [ManagedKind] { &KINDS }

    fn requires(&self, kind: ManagedKind) -> bool {
        match kind {
            ManagedKind::ServiceAccount | ManagedKind::Deployment | ManagedKind::Service => true,
            ManagedKind::ConfigMap => self.infra.prometheus,
            ManagedKind::HorizontalPodAutoscaler => self.infra.autoscaling.is_some(),
            _ => false,
        }
    }

    fn render(&self, kind: ManagedKind) -> Result<ManagedObject, RenderError> {
        Ok(match kind {
            ManagedKind::ServiceAccount => ManagedObject::ServiceAccount(self.service_account()?),
            ManagedKind::ConfigMap => ManagedObject::ConfigMap(self.config_map()?),
            ManagedKind::Deployment => ManagedObject::Deployment(self.deployment()?),
            ManagedKind::Service => ManagedObject::Service(self.service()?),
            ManagedKind::HorizontalPodAutoscaler => ManagedObject::HorizontalPodAutoscaler(self.horizontal_pod_autoscaler()?),
            other => return Err(self.not_enabled(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infra() -> RateLimitInfra { RateLimitInfra::new("tollgate-system", "redis.infra.svc:6379") }

    fn env(d: &Deployment) -> BTreeMap<String, String> {
        let pod = d.spec.as_ref().and_then(|s| s.template.spec.as_ref()).expect("pod");
        pod.containers[0]
            .env
            .iter()
            .flatten()
            .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn base_set_with_prometheus() {
        let (ir, cfg) = (infra(), ServerConfig::default());
        let r = RateLimitRender::new(&ir, vec![], &cfg);
        let set = r.render_all().expect("render");
        assert_eq!(
            set.kinds(),
            vec![ManagedKind::ServiceAccount, ManagedKind::ConfigMap, ManagedKind::Deployment, ManagedKind::Service]
        );
        assert!(set.iter().all(|o| o.meta().name.as_deref() == Some(RATE_LIMIT_NAME)));
        assert_eq!(set.namespace, "tollgate-system");

        let d = r.deployment().expect("deployment");
        let pod = d.spec.as_ref().and_then(|s| s.template.spec.as_ref()).expect("pod");
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec![RATE_LIMIT_CONTAINER, STATSD_EXPORTER_CONTAINER]);
        assert_eq!(pod.containers[0].image.as_deref(), Some(cfg.default_rate_limit_image.as_str()));
        let env = env(&d);
        assert_eq!(env["REDIS_URL"], "redis.infra.svc:6379");
        assert_eq!(env["USE_STATSD"], "true");
        assert_eq!(env["CONFIG_GRPC_XDS_SERVER_URL"], "tollgate.tollgate-system.svc.cluster.local:18001");
    }

    #[test]
    fn disabling_prometheus_drops_exporter_and_config() {
        let ir = RateLimitInfra { prometheus: false, ..infra() };
        let cfg = ServerConfig::default();
        let r = RateLimitRender::new(&ir, vec![], &cfg);
        assert!(!r.requires(ManagedKind::ConfigMap));
        assert!(matches!(r.config_map(), Err(RenderError::NotEnabled { .. })));

        let d = r.deployment().expect("deployment");
        let pod = d.spec.as_ref().and_then(|s| s.template.spec.as_ref()).expect("pod");
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.volumes, None);
        assert_eq!(env(&d)["USE_STATSD"], "false");
        let svc = r.service().expect("service");
        assert_eq!(svc.spec.and_then(|s| s.ports).map(|p| p.len()), Some(1));
    }

    #[test]
    fn autoscaling_replaces_fixed_replicas() {
        let ir = RateLimitInfra {
            replicas: Some(3),
            autoscaling: Some(tollgate_core::AutoscalingConfig { min_replicas: Some(2), max_replicas: 6, target_cpu_utilization: Some(70) }),
            ..infra()
        };
        let cfg = ServerConfig::default();
        let r = RateLimitRender::new(&ir, vec![], &cfg);
        assert!(r.required_kinds().contains(&ManagedKind::HorizontalPodAutoscaler));
        assert_eq!(r.deployment().expect("deployment").spec.and_then(|s| s.replicas), None);
        let hpa = r.horizontal_pod_autoscaler().expect("hpa").spec.expect("spec");
        assert_eq!(hpa.scale_target_ref.name, RATE_LIMIT_NAME);
        assert_eq!(hpa.max_replicas, 6);
    }

    #[test]
    fn user_labels_never_override_the_selector() {
        let mut ir = infra();
        ir.metadata.labels.insert(tollgate_core::APP_NAME_LABEL.to_string(), "spoofed".to_string());
        ir.metadata.labels.insert("team".to_string(), "edge".to_string());
        let cfg = ServerConfig::default();
        let r = RateLimitRender::new(&ir, vec![], &cfg);
        let labels = r.labels();
        assert_eq!(labels[tollgate_core::APP_NAME_LABEL], RATE_LIMIT_NAME);
        assert_eq!(labels["team"], "edge");
        assert_eq!(r.selector().match_labels, Some(rate_limit_labels()));
    }

    #[test]
    fn proxy_only_kinds_are_never_rendered() {
        let (ir, cfg) = (infra(), ServerConfig::default());
        let r = RateLimitRender::new(&ir, vec![], &cfg);
        assert!(!r.managed_kinds().contains(&ManagedKind::Role));
        assert!(matches!(r.render(ManagedKind::DaemonSet), Err(RenderError::NotEnabled { .. })));
    }
}
