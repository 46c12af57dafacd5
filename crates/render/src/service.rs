use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tollgate_core::{Protocol, ServiceType};

use crate::{non_empty, RenderError, ResourceRender};

impl ResourceRender<'_> {
    pub fn service(&self) -> Result<Service, RenderError> {
        let svc = &self.infra.service;

        let mut labels = self.labels()?;
        labels.extend(svc.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut meta = self.object_meta(labels)?;
        let mut annotations = self.infra.metadata.annotations.clone();
        annotations.extend(svc.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        meta.annotations = non_empty(annotations);

        let mut spec = ServiceSpec {
            type_: Some(service_type(svc.service_type).to_string()),
            ports: Some(self.service_ports()),
            selector: self.stable_selector().match_labels,
            session_affinity: Some("None".to_string()),
            ..Default::default()
        };
        match svc.service_type {
            ServiceType::ClusterIP => {
                if let Some(first) = self.infra.addresses.first() {
                    spec.cluster_ip = Some(first.clone());
                    spec.cluster_ips = Some(vec![first.clone()]);
                }
            }
            ServiceType::LoadBalancer | ServiceType::NodePort => {
                if !self.infra.addresses.is_empty() {
                    spec.external_ips = Some(self.infra.addresses.clone());
                }
                spec.external_traffic_policy = Some(svc.external_traffic_policy.as_str().to_string());
            }
        }

        Ok(Service { metadata: meta, spec: Some(spec), ..Default::default() })
    }

    /// Listener ports in declaration order; HTTPS ports of HTTP/3 listeners
    /// get a UDP twin named `<port>-h3`.
    fn service_ports(&self) -> Vec<ServicePort> {
        let mut ports = Vec::new();
        for listener in &self.infra.listeners {
            for p in &listener.ports {
                let target = Some(IntOrString::Int(p.container_port));
                ports.push(ServicePort {
                    name: Some(p.name.clone()),
                    protocol: Some(p.protocol.transport().to_string()),
                    port: p.service_port,
                    target_port: target.clone(),
                    ..Default::default()
                });
                if listener.http3 && p.protocol == Protocol::Https {
                    ports.push(ServicePort {
                        name: Some(format!("{}-h3", p.name)),
                        protocol: Some("UDP".to_string()),
                        port: p.service_port,
                        target_port: target,
                        ..Default::default()
                    });
                }
            }
        }
        ports
    }
}

fn service_type(t: ServiceType) -> &'static str {
    match t {
        ServiceType::ClusterIP => "ClusterIP",
        ServiceType::NodePort => "NodePort",
        ServiceType::LoadBalancer => "LoadBalancer",
    }
}
