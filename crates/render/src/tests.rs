use super::*;
use tollgate_core::{
    AutoscalingConfig, DisruptionBudgetConfig, ListenerPort, Protocol, ProxyListener, ServiceType,
    OWNING_GATEWAY_CLASS_LABEL, OWNING_GATEWAY_NAMESPACE_LABEL, OWNING_GATEWAY_NAME_LABEL,
};

fn port(name: &str, protocol: Protocol, service_port: i32, container_port: i32) -> ListenerPort {
    ListenerPort { name: name.into(), protocol, service_port, container_port }
}

fn infra() -> ProxyInfra {
    let mut i = ProxyInfra::new("default/public", "tollgate-system");
    i.metadata.labels = Labels::from([
        (OWNING_GATEWAY_NAME_LABEL.to_string(), "public".to_string()),
        (OWNING_GATEWAY_NAMESPACE_LABEL.to_string(), "default".to_string()),
    ]);
    i.listeners = vec![
        ProxyListener { name: "http".into(), ports: vec![port("http-80", Protocol::Http, 80, 10080)].into(), http3: false },
        ProxyListener { name: "https".into(), ports: vec![port("https-443", Protocol::Https, 443, 10443)].into(), http3: true },
    ];
    i.bootstrap = "admin:\n  address: {}\n".into();
    i
}

fn gateway_owner() -> OwnerRef {
    OwnerRef {
        api_version: "gateway.networking.k8s.io/v1".into(),
        kind: "GatewayClass".into(),
        name: "tollgate".into(),
        namespace: None,
        uid: Some("2f1c3c7e-0000-4000-8000-000000000001".into()),
    }
}

#[test]
fn every_object_shares_the_hashed_name() {
    let (ir, cfg) = (infra(), ServerConfig::default());
    let r = ResourceRender::new(&ir, vec![], &cfg);
    let name = r.name();
    assert!(name.starts_with("tollgate-"));
    assert!(name.len() <= DNS1123_LABEL_MAX);
    let set = r.render_all().expect("render");
    for obj in set.iter() {
        assert_eq!(obj.meta().name.as_deref(), Some(name.as_str()));
        assert_eq!(obj.meta().namespace.as_deref(), Some("tollgate-system"));
    }
}

#[test]
fn missing_owning_labels_is_a_hard_error() {
    let mut ir = infra();
    ir.metadata.labels.remove(OWNING_GATEWAY_NAMESPACE_LABEL);
    let cfg = ServerConfig::default();
    let r = ResourceRender::new(&ir, vec![], &cfg);
    assert_eq!(r.render_all(), Err(RenderError::MissingRequiredLabel { name: "default/public".into() }));

    ir.metadata.labels.insert(OWNING_GATEWAY_CLASS_LABEL.into(), "tollgate".into());
    assert!(ResourceRender::new(&ir, vec![], &cfg).render_all().is_ok());
}

#[test]
fn required_kinds_follow_features() {
    let cfg = ServerConfig::default();
    let mut ir = infra();
    let base = ResourceRender::new(&ir, vec![], &cfg).required_kinds();
    assert_eq!(
        base,
        vec![ManagedKind::ServiceAccount, ManagedKind::ConfigMap, ManagedKind::Deployment, ManagedKind::Service]
    );

    ir.features.pod_introspection = true;
    ir.features.disruption_budget = Some(DisruptionBudgetConfig { min_available: Some("1".into()), max_unavailable: None });
    ir.features.autoscaling = Some(AutoscalingConfig { min_replicas: Some(2), max_replicas: 5, target_cpu_utilization: Some(80) });
    assert_eq!(
        ResourceRender::new(&ir, vec![], &cfg).required_kinds(),
        vec![
            ManagedKind::ServiceAccount,
            ManagedKind::ConfigMap,
            ManagedKind::Role,
            ManagedKind::RoleBinding,
            ManagedKind::Deployment,
            ManagedKind::Service,
            ManagedKind::HorizontalPodAutoscaler,
            ManagedKind::PodDisruptionBudget,
        ]
    );

    ir.workload = WorkloadKind::DaemonSet;
    let kinds = ResourceRender::new(&ir, vec![], &cfg).required_kinds();
    assert!(kinds.contains(&ManagedKind::DaemonSet));
    assert!(!kinds.contains(&ManagedKind::Deployment));
    assert!(!kinds.contains(&ManagedKind::HorizontalPodAutoscaler));
}

#[test]
fn render_is_byte_identical_across_calls() {
    let cfg = ServerConfig::default();
    let mut a = infra();
    a.metadata.annotations.insert("b".into(), "2".into());
    a.metadata.annotations.insert("a".into(), "1".into());
    a.features.pod_introspection = true;
    let mut b = a.clone();
    b.metadata.annotations = [("a", "1"), ("b", "2")].into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

    let owners = vec![gateway_owner()];
    let first = serde_json::to_vec(&ResourceRender::new(&a, owners.clone(), &cfg).render_all().expect("a")).expect("json");
    let second = serde_json::to_vec(&ResourceRender::new(&a, owners.clone(), &cfg).render_all().expect("a")).expect("json");
    let reordered = serde_json::to_vec(&ResourceRender::new(&b, owners, &cfg).render_all().expect("b")).expect("json");
    assert_eq!(first, second);
    assert_eq!(first, reordered);
}

#[test]
fn selector_ignores_custom_labels() {
    let cfg = ServerConfig::default();
    let plain = infra();
    let mut custom = infra();
    custom.metadata.labels.insert("team".into(), "edge".into());
    custom.pod.labels.insert("sidecar".into(), "off".into());

    let d1 = ResourceRender::new(&plain, vec![], &cfg).deployment().expect("d1");
    let d2 = ResourceRender::new(&custom, vec![], &cfg).deployment().expect("d2");
    let (s1, s2) = (d1.spec.expect("spec"), d2.spec.expect("spec"));
    assert_eq!(s1.selector, s2.selector);

    let pod_labels = s2.template.metadata.and_then(|m| m.labels).expect("labels");
    assert_eq!(pod_labels.get("team").map(String::as_str), Some("edge"));
    assert_eq!(pod_labels.get("sidecar").map(String::as_str), Some("off"));
    for (k, v) in s2.selector.match_labels.expect("match labels") {
        assert_eq!(pod_labels.get(&k), Some(&v), "selector label {k} not on pods");
    }
}

#[test]
fn service_exposes_listeners_with_h3_twin() {
    let cfg = ServerConfig::default();
    let ir = infra();
    let svc = ResourceRender::new(&ir, vec![], &cfg).service().expect("svc");
    let spec = svc.spec.expect("spec");
    let ports: Vec<_> = spec
        .ports
        .expect("ports")
        .into_iter()
        .map(|p| (p.name.unwrap_or_default(), p.protocol.unwrap_or_default(), p.port))
        .collect();
    assert_eq!(
        ports,
        vec![
            ("http-80".to_string(), "TCP".to_string(), 80),
            ("https-443".to_string(), "TCP".to_string(), 443),
            ("https-443-h3".to_string(), "UDP".to_string(), 443),
        ]
    );
    assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
    assert_eq!(spec.external_traffic_policy.as_deref(), Some("Local"));
}

#[test]
fn cluster_ip_service_takes_first_address() {
    let cfg = ServerConfig::default();
    let mut ir = infra();
    ir.service.service_type = ServiceType::ClusterIP;
    ir.addresses = vec!["10.96.0.42".into(), "10.96.0.43".into()];
    let spec = ResourceRender::new(&ir, vec![], &cfg).service().expect("svc").spec.expect("spec");
    assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.42"));
    assert_eq!(spec.cluster_ips, Some(vec!["10.96.0.42".to_string()]));
    assert_eq!(spec.external_ips, None);
    assert_eq!(spec.external_traffic_policy, None);
}

#[test]
fn owner_references_are_copied_exactly() {
    let cfg = ServerConfig::default();
    let ir = infra();
    let set = ResourceRender::new(&ir, vec![gateway_owner()], &cfg).render_all().expect("render");
    for obj in set.iter() {
        let refs = obj.meta().owner_references.clone().expect("owner refs");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "GatewayClass");
        assert_eq!(refs[0].uid, "2f1c3c7e-0000-4000-8000-000000000001");
    }

    let unresolved = OwnerRef { uid: None, ..gateway_owner() };
    assert!(matches!(
        ResourceRender::new(&ir, vec![unresolved], &cfg).service_account(),
        Err(RenderError::UnresolvedOwner { .. })
    ));
}

#[test]
fn bootstrap_payload_is_embedded_verbatim() {
    let cfg = ServerConfig::default();
    let ir = infra();
    let d = ResourceRender::new(&ir, vec![], &cfg).deployment().expect("deployment");
    let pod = d.spec.and_then(|s| s.template.spec).expect("pod spec");
    let args = pod.containers[0].args.clone().expect("args");
    let at = args.iter().position(|a| a == "--config-yaml").expect("flag");
    assert_eq!(args[at + 1], ir.bootstrap);
    assert_eq!(pod.containers[0].image.as_deref(), Some(cfg.default_proxy_image.as_str()));
    assert_eq!(pod.service_account_name, Some(ResourceRender::new(&ir, vec![], &cfg).name()));
}

#[test]
fn autoscaled_deployment_leaves_replicas_to_the_hpa() {
    let cfg = ServerConfig::default();
    let mut ir = infra();
    ir.replicas = Some(3);
    assert_eq!(ResourceRender::new(&ir, vec![], &cfg).deployment().expect("d").spec.and_then(|s| s.replicas), Some(3));

    ir.features.autoscaling = Some(AutoscalingConfig { min_replicas: None, max_replicas: 4, target_cpu_utilization: None });
    let r = ResourceRender::new(&ir, vec![], &cfg);
    assert_eq!(r.deployment().expect("d").spec.and_then(|s| s.replicas), None);
    let hpa = r.horizontal_pod_autoscaler().expect("hpa").spec.expect("spec");
    assert_eq!(hpa.scale_target_ref.name, r.name());
    assert_eq!(hpa.max_replicas, 4);
    assert_eq!(hpa.metrics, None);
}

#[test]
fn disabled_features_do_not_render() {
    let cfg = ServerConfig::default();
    let ir = infra();
    let r = ResourceRender::new(&ir, vec![], &cfg);
    assert!(matches!(r.role(), Err(RenderError::NotEnabled { kind: ManagedKind::Role, .. })));
    assert!(matches!(r.pod_disruption_budget(), Err(RenderError::NotEnabled { .. })));
    assert!(matches!(r.horizontal_pod_autoscaler(), Err(RenderError::NotEnabled { .. })));
}

#[test]
fn disruption_budget_bounds_parse_as_int_or_percent() {
    assert_eq!(int_or_percent("2"), IntOrString::Int(2));
    assert_eq!(int_or_percent("50%"), IntOrString::String("50%".into()));

    let cfg = ServerConfig::default();
    let mut ir = infra();
    ir.features.disruption_budget = Some(DisruptionBudgetConfig { min_available: None, max_unavailable: Some("25%".into()) });
    let spec = ResourceRender::new(&ir, vec![], &cfg).pod_disruption_budget().expect("pdb").spec.expect("spec");
    assert_eq!(spec.max_unavailable, Some(IntOrString::String("25%".into())));
    assert_eq!(spec.min_available, None);
}

#[test]
fn role_binding_targets_the_service_account() {
    let cfg = ServerConfig::default();
    let mut ir = infra();
    ir.features.pod_introspection = true;
    let r = ResourceRender::new(&ir, vec![], &cfg);
    let rb = r.role_binding().expect("binding");
    assert_eq!(rb.role_ref.kind, "Role");
    assert_eq!(rb.role_ref.name, r.name());
    let subject = &rb.subjects.expect("subjects")[0];
    assert_eq!(subject.kind, "ServiceAccount");
    assert_eq!(subject.namespace.as_deref(), Some("tollgate-system"));
}

#[test]
fn config_map_carries_sds_documents() {
    let cfg = ServerConfig::default();
    let ir = infra();
    let cm = ResourceRender::new(&ir, vec![], &cfg).config_map().expect("cm");
    let data = cm.data.expect("data");
    let ca: serde_json::Value = serde_json::from_str(&data[SDS_CA_FILE]).expect("ca json");
    assert_eq!(ca["resources"][0]["validation_context"]["trusted_ca"]["filename"], "/certs/ca.crt");
    assert!(data[SDS_CERT_FILE].contains("/certs/tls.key"));
}

#[test]
fn infra_from_yaml_renders() {
    let yaml = r#"
name: team-a/internal
namespace: tollgate-system
metadata:
  labels:
    tollgate.io/owning-gatewayclass: tollgate
workload: DaemonSet
service:
  type: NodePort
listeners:
  - name: tcp
    ports:
      - name: tcp-9000
        protocol: TCP
        servicePort: 9000
        containerPort: 19000
"#;
    let ir: ProxyInfra = serde_yaml::from_str(yaml).expect("yaml");
    let cfg = ServerConfig::default();
    let set = ResourceRender::new(&ir, vec![], &cfg).render_all().expect("render");
    assert_eq!(
        set.kinds(),
        vec![ManagedKind::ServiceAccount, ManagedKind::ConfigMap, ManagedKind::DaemonSet, ManagedKind::Service]
    );
    assert!(set.get(ManagedKind::DaemonSet).is_some());
}
