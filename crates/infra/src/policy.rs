//! Update policy shared by every managed kind.
//!
//! A live object is rewritten when its spec-hash annotation differs from the
//! desired one, or when a field the renderer sets no longer holds the
//! rendered value. Fields only the server populates are ignored. Before
//! writing, server allocations are carried over and immutable workload
//! selectors are kept.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde_json::Value;
use tollgate_apply::UpdateDecision;
use tollgate_core::SPEC_HASH_ANNOTATION;
use tollgate_kubehub::ManagedObject;

pub(crate) fn prepare(live: &ManagedObject, next: &mut ManagedObject) -> UpdateDecision {
    let violation = keep_live_selector(live, next);
    let write = live.annotation(SPEC_HASH_ANNOTATION) != next.annotation(SPEC_HASH_ANNOTATION) || !still_rendered(live, next);
    if write {
        keep_server_assigned(live, next);
    }
    UpdateDecision { write, violation }
}

/// Whether `live` still carries every field of `desired`. Extra live fields
/// (status, server defaults, foreign labels) do not count as drift.
fn still_rendered(live: &ManagedObject, desired: &ManagedObject) -> bool {
    match (serde_json::to_value(live), serde_json::to_value(desired)) {
        (Ok(live), Ok(desired)) => covers(&live, &desired),
        _ => false,
    }
}

fn covers(live: &Value, want: &Value) -> bool {
    match (live, want) {
        (Value::Object(live), Value::Object(want)) => want.iter().all(|(k, w)| match live.get(k) {
            Some(l) => covers(l, w),
            None => is_empty(w),
        }),
        (Value::Array(live), Value::Array(want)) => {
            live.len() == want.len() && live.iter().zip(want).all(|(l, w)| covers(l, w))
        }
        (_, Value::Null) => true,
        (live, want) => live == want || (is_empty(want) && is_empty(live)),
    }
}

/// The API server drops empty maps and lists.
fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Workload selectors cannot change in place. When the live selector differs,
/// keep it; when it would no longer select the desired pod labels, keep the
/// live pod labels too and report the incompatible change.
fn keep_live_selector(live: &ManagedObject, next: &mut ManagedObject) -> Option<String> {
    let (live_selector, live_pod_labels) = workload_selector(live)?;
    let (selector, pod_labels) = workload_selector_mut(next)?;
    if *selector == live_selector {
        return None;
    }
    *selector = live_selector;
    if selects(selector, pod_labels.as_ref()) {
        return None;
    }
    *pod_labels = live_pod_labels;
    Some("spec.selector no longer matches the pod labels and cannot be changed in place".to_string())
}

fn workload_selector(obj: &ManagedObject) -> Option<(LabelSelector, Option<BTreeMap<String, String>>)> {
    let (selector, template) = match obj {
        ManagedObject::Deployment(d) => d.spec.as_ref().map(|s| (&s.selector, &s.template))?,
        ManagedObject::DaemonSet(d) => d.spec.as_ref().map(|s| (&s.selector, &s.template))?,
        _ => return None,
    };
    Some((selector.clone(), template.metadata.as_ref().and_then(|m| m.labels.clone())))
}

fn workload_selector_mut(obj: &mut ManagedObject) -> Option<(&mut LabelSelector, &mut Option<BTreeMap<String, String>>)> {
    let (selector, template) = match obj {
        ManagedObject::Deployment(d) => d.spec.as_mut().map(|s| (&mut s.selector, &mut s.template))?,
        ManagedObject::DaemonSet(d) => d.spec.as_mut().map(|s| (&mut s.selector, &mut s.template))?,
        _ => return None,
    };
    Some((selector, &mut template.metadata.get_or_insert_with(Default::default).labels))
}

/// Equality-based match; rendered selectors never use expressions.
fn selects(selector: &LabelSelector, labels: Option<&BTreeMap<String, String>>) -> bool {
    if selector.match_expressions.as_ref().is_some_and(|e| !e.is_empty()) {
        return false;
    }
    let Some(wanted) = selector.match_labels.as_ref() else { return true };
    wanted.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

fn keep_server_assigned(live: &ManagedObject, next: &mut ManagedObject) {
    if let (ManagedObject::Service(live), ManagedObject::Service(next)) = (live, next) {
        if let (Some(live), Some(next)) = (live.spec.as_ref(), next.spec.as_mut()) {
            keep_service_allocations(live, next);
        }
    }
}

/// Cluster IPs and node ports are allocated by the server; an update that
/// omits them must not release them.
fn keep_service_allocations(live: &ServiceSpec, next: &mut ServiceSpec) {
    if next.cluster_ip.is_none() {
        next.cluster_ip = live.cluster_ip.clone();
        next.cluster_ips = live.cluster_ips.clone();
    }
    if next.health_check_node_port.is_none() && next.type_ == live.type_ {
        next.health_check_node_port = live.health_check_node_port;
    }
    let (Some(live_ports), Some(ports)) = (live.ports.as_ref(), next.ports.as_mut()) else { return };
    for p in ports.iter_mut().filter(|p| p.node_port.is_none()) {
        p.node_port = live_ports
            .iter()
            .find(|lp| lp.name == p.name && lp.protocol == p.protocol)
            .and_then(|lp| lp.node_port);
    }
}
