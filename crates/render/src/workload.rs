//! Proxy workloads: the pod template shared by Deployment and DaemonSet.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, KeyToPath,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::{non_empty, Render, RenderError, ResourceRender, CERTS_DIR, SDS_CA_FILE, SDS_CERT_FILE, XDS_CERT_SECRET};

pub const PROXY_CONTAINER: &str = "envoy";
pub const STATS_PORT: i32 = 19001;
pub const READINESS_PORT: i32 = 19003;

const READINESS_PATH: &str = "/ready";
const POD_NAMESPACE_ENV: &str = "ENVOY_POD_NAMESPACE";
const POD_NAME_ENV: &str = "ENVOY_POD_NAME";
const XDS_HOST_ENV: &str = "TOLLGATE_XDS_HOST";
const TERMINATION_GRACE_SECONDS: i64 = 360;
const REVISION_HISTORY: i32 = 10;
const PROGRESS_DEADLINE_SECONDS: i32 = 600;
const FILE_MODE: i32 = 0o644;

impl ResourceRender<'_> {
    pub fn deployment(&self) -> Result<Deployment, RenderError> {
        let replicas = if self.autoscaled() { None } else { Some(self.infra.replicas.unwrap_or(1)) };
        Ok(Deployment {
            metadata: self.object_meta(self.labels()?)?,
            spec: Some(DeploymentSpec {
                replicas,
                selector: self.stable_selector(),
                template: self.pod_template()?,
                revision_history_limit: Some(REVISION_HISTORY),
                progress_deadline_seconds: Some(PROGRESS_DEADLINE_SECONDS),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    pub fn daemon_set(&self) -> Result<DaemonSet, RenderError> {
        Ok(DaemonSet {
            metadata: self.object_meta(self.labels()?)?,
            spec: Some(DaemonSetSpec {
                selector: self.stable_selector(),
                template: self.pod_template()?,
                revision_history_limit: Some(REVISION_HISTORY),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn pod_template(&self) -> Result<PodTemplateSpec, RenderError> {
        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(self.pod_labels()?),
                annotations: self.pod_annotations(),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![self.proxy_container()],
                service_account_name: Some(self.name()),
                termination_grace_period_seconds: Some(TERMINATION_GRACE_SECONDS),
                dns_policy: Some("ClusterFirst".to_string()),
                restart_policy: Some("Always".to_string()),
                scheduler_name: Some("default-scheduler".to_string()),
                volumes: Some(self.volumes()),
                node_selector: non_empty(self.infra.pod.node_selector.clone()),
                ..Default::default()
            }),
        })
    }

    fn pod_annotations(&self) -> Option<BTreeMap<String, String>> {
        let mut a = self.infra.metadata.annotations.clone();
        a.extend(self.infra.pod.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        if self.infra.features.prometheus {
            a.insert("prometheus.io/path".to_string(), "/stats/prometheus".to_string());
            a.insert("prometheus.io/scrape".to_string(), "true".to_string());
            a.insert("prometheus.io/port".to_string(), STATS_PORT.to_string());
        }
        non_empty(a)
    }

    fn proxy_container(&self) -> Container {
        let image = self.infra.image.clone().unwrap_or_else(|| self.config.default_proxy_image.clone());
        Container {
            name: PROXY_CONTAINER.to_string(),
            image: Some(image),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(vec!["envoy".to_string()]),
            args: Some(self.proxy_args()),
            env: Some(self.env()),
            ports: Some(self.container_ports()),
            resources: self.infra.resources.as_ref().map(|r| ResourceRequirements {
                requests: non_empty(quantities(&r.requests)),
                limits: non_empty(quantities(&r.limits)),
                ..Default::default()
            }),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: "certs".to_string(),
                    mount_path: CERTS_DIR.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
                VolumeMount { name: "sds".to_string(), mount_path: "/sds".to_string(), ..Default::default() },
            ]),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some(READINESS_PATH.to_string()),
                    port: IntOrString::Int(READINESS_PORT),
                    scheme: Some("HTTP".to_string()),
                    ..Default::default()
                }),
                timeout_seconds: Some(1),
                period_seconds: Some(5),
                success_threshold: Some(1),
                failure_threshold: Some(1),
                ..Default::default()
            }),
            termination_message_path: Some("/dev/termination-log".to_string()),
            termination_message_policy: Some("File".to_string()),
            ..Default::default()
        }
    }

    /// The bootstrap payload is passed through untouched.
    fn proxy_args(&self) -> Vec<String> {
        vec![
            "--service-cluster".to_string(),
            self.name(),
            "--service-node".to_string(),
            format!("$({POD_NAME_ENV})"),
            "--config-yaml".to_string(),
            self.infra.bootstrap.clone(),
            "--log-level".to_string(),
            self.infra.log_level.clone(),
        ]
    }

    fn env(&self) -> Vec<EnvVar> {
        let field = |name: &str, path: &str| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    api_version: Some("v1".to_string()),
                    field_path: path.to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        vec![
            field(POD_NAMESPACE_ENV, "metadata.namespace"),
            field(POD_NAME_ENV, "metadata.name"),
            EnvVar {
                name: XDS_HOST_ENV.to_string(),
                value: Some(format!(
                    "tollgate.{}.svc.{}",
                    self.config.controller_namespace, self.config.dns_domain
                )),
                ..Default::default()
            },
        ]
    }

    /// Admin ports first, then one port per distinct listener port and
    /// transport in declaration order.
    fn container_ports(&self) -> Vec<ContainerPort> {
        let mut ports = Vec::new();
        if self.infra.features.prometheus {
            ports.push(named_port("metrics", STATS_PORT));
        }
        ports.push(named_port("readiness", READINESS_PORT));

        let mut seen: Vec<(i32, &str)> = Vec::new();
        for listener in &self.infra.listeners {
            for p in &listener.ports {
                let mut transports = vec![p.protocol.transport()];
                if listener.http3 && p.protocol == tollgate_core::Protocol::Https {
                    transports.push("UDP");
                }
                for t in transports {
                    if seen.contains(&(p.container_port, t)) {
                        continue;
                    }
                    seen.push((p.container_port, t));
                    ports.push(ContainerPort {
                        container_port: p.container_port,
                        protocol: Some(t.to_string()),
                        ..Default::default()
                    });
                }
            }
        }
        ports
    }

    fn volumes(&self) -> Vec<Volume> {
        vec![
            Volume {
                name: "certs".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(XDS_CERT_SECRET.to_string()),
                    default_mode: Some(FILE_MODE),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "sds".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(self.name()),
                    items: Some(
                        [SDS_CA_FILE, SDS_CERT_FILE]
                            .into_iter()
                            .map(|f| KeyToPath { key: f.to_string(), path: f.to_string(), mode: None })
                            .collect(),
                    ),
                    default_mode: Some(FILE_MODE),
                    optional: Some(false),
                }),
                ..Default::default()
            },
        ]
    }
}

fn named_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

pub(crate) fn quantities(m: &BTreeMap<String, String>) -> BTreeMap<String, Quantity> {
    m.iter().map(|(k, v)| (k.clone(), Quantity(v.clone()))).collect()
}
