//! Tollgate infra: converges the managed objects of a proxy fleet with its
//! [`ProxyInfra`] description, and those of the global rate-limit service
//! with its [`RateLimitInfra`], and tears them down.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tollgate_apply::{ApplyError, ApplyOutcome, InfraClient, RetryPolicy};
use tollgate_core::{IrError, OwnerRef, ProxyInfra, RateLimitInfra, ServerConfig};
use tollgate_kubehub::{ManagedKind, ObjectKey};
use tollgate_render::{RateLimitRender, Render, RenderError, ResourceRender};
use tracing::{debug, info, warn};

mod policy;

/// Lifecycle of one logical proxy as seen by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObjectState {
    Absent,
    Reconciling,
    Converged,
}

/// What happened to one kind during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    Created,
    Updated,
    Unchanged,
    Deleted,
    /// Not required and not present.
    Absent,
    Failed,
}

impl From<ApplyOutcome> for Action {
    fn from(o: ApplyOutcome) -> Self {
        match o {
            ApplyOutcome::Created => Action::Created,
            ApplyOutcome::Updated => Action::Updated,
            ApplyOutcome::Unchanged => Action::Unchanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ManagedKind,
    /// The object was written but an immutable field kept its live value.
    pub immutable_field: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub name: String,
    pub namespace: String,
    pub resource_name: String,
    pub actions: Vec<(ManagedKind, Action)>,
    pub failures: Vec<Failure>,
}

impl ReconcileReport {
    fn new(name: &str, namespace: &str, resource_name: String) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            resource_name,
            actions: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn action(&self, kind: ManagedKind) -> Option<Action> {
        self.actions.iter().find(|(k, _)| *k == kind).map(|(_, a)| *a)
    }

    pub fn is_clean(&self) -> bool { self.failures.is_empty() }

    fn fail(&mut self, kind: ManagedKind, err: &ApplyError) {
        self.actions.push((kind, Action::Failed));
        self.failures.push(Failure {
            kind,
            immutable_field: matches!(err, ApplyError::ImmutableField { .. }),
            message: err.to_string(),
        });
    }

    fn summary(&self) -> String {
        self.failures.iter().map(|f| format!("{}: {}", f.kind, f.message)).collect::<Vec<_>>().join("; ")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error(transparent)]
    Invalid(#[from] IrError),
    #[error("{name}: resolving owner: {source}")]
    Owner {
        name: String,
        #[source]
        source: ApplyError,
    },
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("reconciliation cancelled")]
    Cancelled,
    #[error("{}: {} resource(s) failed: {}", .0.name, .0.failures.len(), .0.summary())]
    Aggregate(ReconcileReport),
}

impl InfraError {
    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            InfraError::Aggregate(r) => Some(r),
            _ => None,
        }
    }
}

fn rejected(e: IrError) -> IrError {
    warn!(error = %e, "rejecting invalid infra");
    e
}

/// Reconciler for proxy and rate-limit infrastructure.
pub struct Infra {
    client: ArcSwap<InfraClient>,
    config: ArcSwap<ServerConfig>,
    states: Mutex<BTreeMap<String, ObjectState>>,
}

impl Infra {
    pub fn new(client: InfraClient, config: ServerConfig) -> Self {
        Self {
            client: ArcSwap::from_pointee(client),
            config: ArcSwap::from_pointee(config),
            states: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> Arc<ServerConfig> { self.config.load_full() }

    /// Swap in new settings; passes already running keep the old ones.
    pub fn reload(&self, config: ServerConfig) {
        let client = self.client.load().with_retry(RetryPolicy::from(&config.retry));
        self.client.store(Arc::new(client));
        self.config.store(Arc::new(config));
        info!("infra reconciler configuration reloaded");
    }

    pub fn state(&self, name: &str) -> ObjectState {
        self.lock_states().get(name).copied().unwrap_or(ObjectState::Absent)
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ObjectState>> {
        self.states.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, name: &str, state: ObjectState) {
        let mut states = self.lock_states();
        match state {
            ObjectState::Absent => states.remove(name),
            s => states.insert(name.to_string(), s),
        };
    }

    /// Bring every kind the proxy may ever need to its desired state: apply
    /// the required kinds, delete the others. Every kind is attempted; all
    /// failures come back together in [`InfraError::Aggregate`].
    ///
    /// The state stays `Reconciling` after an aggregate failure. A pass that
    /// stops before applying anything, or is cancelled, leaves the state it
    /// found.
    pub async fn create_or_update(&self, infra: &ProxyInfra, cancel: &CancellationToken) -> Result<ReconcileReport, InfraError> {
        infra.validate().map_err(rejected)?;
        let client = self.client.load_full();
        let config = self.config.load_full();
        let pass = async {
            let owners = self.resolve_owners(&client, &infra.name, infra.metadata.owner_reference.as_ref(), cancel).await?;
            self.converge(&client, &infra.name, &ResourceRender::new(infra, owners, &config), cancel).await
        };
        self.tracked(&infra.name, ObjectState::Converged, pass).await
    }

    /// [`Infra::create_or_update`] for the global rate-limit service.
    pub async fn create_or_update_rate_limit(
        &self,
        infra: &RateLimitInfra,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, InfraError> {
        infra.validate().map_err(rejected)?;
        let client = self.client.load_full();
        let config = self.config.load_full();
        let pass = async {
            let owners = self.resolve_owners(&client, infra.name(), infra.metadata.owner_reference.as_ref(), cancel).await?;
            self.converge(&client, infra.name(), &RateLimitRender::new(infra, owners, &config), cancel).await
        };
        self.tracked(infra.name(), ObjectState::Converged, pass).await
    }

    /// Delete every kind by its deterministic name. Already-absent objects
    /// count as deleted.
    pub async fn delete(&self, infra: &ProxyInfra, cancel: &CancellationToken) -> Result<ReconcileReport, InfraError> {
        infra.validate()?;
        let client = self.client.load_full();
        let config = self.config.load_full();
        let render = ResourceRender::new(infra, Vec::new(), &config);
        self.tracked(&infra.name, ObjectState::Absent, self.teardown(&client, &infra.name, &render, cancel)).await
    }

    pub async fn delete_rate_limit(&self, infra: &RateLimitInfra, cancel: &CancellationToken) -> Result<ReconcileReport, InfraError> {
        infra.validate()?;
        let client = self.client.load_full();
        let config = self.config.load_full();
        let render = RateLimitRender::new(infra, Vec::new(), &config);
        self.tracked(infra.name(), ObjectState::Absent, self.teardown(&client, infra.name(), &render, cancel)).await
    }

    /// Run `pass` as `Reconciling`; move to `done` on success, stay on an
    /// aggregate failure, restore the previous state otherwise.
    async fn tracked<F>(&self, name: &str, done: ObjectState, pass: F) -> Result<ReconcileReport, InfraError>
    where
        F: Future<Output = Result<ReconcileReport, InfraError>>,
    {
        let previous = self.state(name);
        self.set_state(name, ObjectState::Reconciling);
        let res = pass.await;
        match &res {
            Ok(_) => self.set_state(name, done),
            Err(InfraError::Aggregate(_)) => {}
            Err(_) => self.set_state(name, previous),
        }
        res
    }

    async fn converge(
        &self,
        client: &InfraClient,
        name: &str,
        render: &dyn Render,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, InfraError> {
        let started = Instant::now();
        // render everything before the first write so a bad IR never applies partially
        let set = render.render_all()?;
        let mut report = ReconcileReport::new(name, render.namespace(), set.name.clone());

        for mut obj in set {
            let kind = obj.kind();
            obj.stamp_spec_hash();
            match client.create_or_update(&obj, policy::prepare, cancel).await {
                Ok(outcome) => report.actions.push((kind, outcome.into())),
                Err(ApplyError::Cancelled) => return Err(InfraError::Cancelled),
                Err(e) => report.fail(kind, &e),
            }
        }

        let key = ObjectKey::new(render.namespace(), report.resource_name.clone());
        for kind in render.managed_kinds().iter().copied().filter(|k| !render.requires(*k)) {
            match client.delete(kind, &key, cancel).await {
                Ok(true) => report.actions.push((kind, Action::Deleted)),
                Ok(false) => report.actions.push((kind, Action::Absent)),
                Err(ApplyError::Cancelled) => return Err(InfraError::Cancelled),
                Err(e) => report.fail(kind, &e),
            }
        }

        histogram!("infra_reconcile_duration_seconds", started.elapsed().as_secs_f64());
        if report.is_clean() {
            counter!("infra_reconcile_total", 1, "result" => "converged");
            debug!(name = %name, namespace = %report.namespace, actions = ?report.actions, "infra converged");
            Ok(report)
        } else {
            counter!("infra_reconcile_total", 1, "result" => "failed");
            Err(InfraError::Aggregate(report))
        }
    }

    async fn teardown(
        &self,
        client: &InfraClient,
        name: &str,
        render: &dyn Render,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, InfraError> {
        let mut report = ReconcileReport::new(name, render.namespace(), render.name());
        let key = ObjectKey::new(render.namespace(), report.resource_name.clone());
        for kind in render.managed_kinds().iter().rev().copied() {
            match client.delete(kind, &key, cancel).await {
                Ok(true) => report.actions.push((kind, Action::Deleted)),
                Ok(false) => report.actions.push((kind, Action::Absent)),
                Err(ApplyError::Cancelled) => return Err(InfraError::Cancelled),
                Err(e) => report.fail(kind, &e),
            }
        }

        if report.is_clean() {
            info!(name = %name, namespace = %report.namespace, "infra deleted");
            Ok(report)
        } else {
            Err(InfraError::Aggregate(report))
        }
    }

    async fn resolve_owners(
        &self,
        client: &InfraClient,
        name: &str,
        owner: Option<&OwnerRef>,
        cancel: &CancellationToken,
    ) -> Result<Vec<OwnerRef>, InfraError> {
        let Some(owner) = owner else { return Ok(Vec::new()) };
        if owner.uid.is_some() {
            return Ok(vec![owner.clone()]);
        }
        match client.get_uid(owner, cancel).await {
            Ok(uid) => Ok(vec![owner.with_uid(uid)]),
            Err(ApplyError::Cancelled) => Err(InfraError::Cancelled),
            Err(source) => Err(InfraError::Owner { name: name.to_string(), source }),
        }
    }
}
