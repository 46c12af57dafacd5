use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tollgate_core::{ProxyInfra, RateLimitInfra, ServerConfig};
use tollgate_infra::{Infra, InfraError, ReconcileReport};
use tollgate_store::{Snapshot, SnapshotStore};
use tracing::{debug, info, warn};

use crate::task::{LastError, TaskSlot};
use crate::{Runner, RunnerError};

/// A logical object the infrastructure runner converges and tears down.
#[async_trait]
pub trait InfraTarget: Clone + PartialEq + Send + Sync + 'static {
    fn target_name(&self) -> &str;

    async fn reconcile(&self, infra: &Infra, cancel: &CancellationToken) -> Result<ReconcileReport, InfraError>;

    async fn remove(&self, infra: &Infra, cancel: &CancellationToken) -> Result<ReconcileReport, InfraError>;
}

#[async_trait]
impl InfraTarget for ProxyInfra {
    fn target_name(&self) -> &str { &self.name }

    async fn reconcile(&self, infra: &Infra, cancel: &CancellationToken) -> Result<ReconcileReport, InfraError> {
        infra.create_or_update(self, cancel).await
    }

    async fn remove(&self, infra: &Infra, cancel: &CancellationToken) -> Result<ReconcileReport, InfraError> {
        infra.delete(self, cancel).await
    }
}

#[async_trait]
impl InfraTarget for RateLimitInfra {
    fn target_name(&self) -> &str { self.name() }

    async fn reconcile(&self, infra: &Infra, cancel: &CancellationToken) -> Result<ReconcileReport, InfraError> {
        infra.create_or_update_rate_limit(self, cancel).await
    }

    async fn remove(&self, infra: &Infra, cancel: &CancellationToken) -> Result<ReconcileReport, InfraError> {
        infra.delete_rate_limit(self, cancel).await
    }
}

/// Reconciles every change of an IR store against the cluster.
///
/// Only keys that changed since the previous snapshot are reconciled; the
/// whole snapshot is reconciled again every resync period to repair drift.
/// Failed reconciles and deletes are retried on every later pass, and the
/// runner error stays set until none are left.
pub struct InfraRunner<T = ProxyInfra> {
    task: TaskSlot,
    input: SnapshotStore<String, T>,
    infra: Arc<Infra>,
    resync: watch::Sender<Option<Duration>>,
}

impl<T: InfraTarget> InfraRunner<T> {
    /// Runner named "infrastructure"; see [`InfraRunner::with_name`].
    pub fn new(input: SnapshotStore<String, T>, infra: Arc<Infra>) -> Self {
        let resync = resync_period(&infra.config());
        Self { task: TaskSlot::new("infrastructure"), input, infra, resync: watch::channel(resync).0 }
    }

    /// Rename before registering; names are unique within a manager.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.task = TaskSlot::new(name);
        self
    }

    /// Override the resync period; `None` disables resyncs.
    pub fn with_resync(self, period: Option<Duration>) -> Self {
        self.resync.send_replace(period);
        self
    }

    pub fn infra(&self) -> &Arc<Infra> { &self.infra }
}

fn resync_period(config: &ServerConfig) -> Option<Duration> {
    (config.resync_interval_secs > 0).then(|| Duration::from_secs(config.resync_interval_secs))
}

fn resync_timer(period: Option<Duration>) -> Option<Interval> {
    period.map(|p| {
        let mut timer = tokio::time::interval_at(Instant::now() + p, p);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    })
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Reconcile,
    Delete,
}

/// Failed work by store key, retried on every later pass until it succeeds.
type Pending<T> = BTreeMap<String, (Op, T)>;

struct Pass<'a, T> {
    runner: &'a str,
    infra: &'a Infra,
    cancel: &'a CancellationToken,
    errors: &'a LastError,
    pending: &'a mut Pending<T>,
    done: BTreeSet<String>,
}

impl<'a, T: InfraTarget> Pass<'a, T> {
    fn new(
        runner: &'a str,
        infra: &'a Infra,
        cancel: &'a CancellationToken,
        errors: &'a LastError,
        pending: &'a mut Pending<T>,
    ) -> Self {
        Self { runner, infra, cancel, errors, pending, done: BTreeSet::new() }
    }

    /// `false` once cancelled.
    async fn run(&mut self, key: &str, op: Op, target: &T) -> bool {
        let res = match op {
            Op::Reconcile => target.reconcile(self.infra, self.cancel).await.map(|_| ()),
            Op::Delete => target.remove(self.infra, self.cancel).await.map(|_| ()),
        };
        self.done.insert(key.to_string());
        match res {
            Ok(()) => {
                self.pending.remove(key);
                true
            }
            Err(InfraError::Cancelled) => false,
            Err(e) => {
                counter!("runner_errors_total", 1, "runner" => self.runner.to_string());
                warn!(runner = %self.runner, infra = %target.target_name(), op = ?op, error = %e, "infra pass failed, will retry");
                self.errors.record(e.to_string());
                self.pending.insert(key.to_string(), (op, target.clone()));
                true
            }
        }
    }

    /// Retry earlier failures this pass has not already covered, then clear
    /// the runner error if nothing is left.
    async fn finish(mut self) -> bool {
        let retries: Vec<_> = self
            .pending
            .iter()
            .filter(|(key, _)| !self.done.contains(*key))
            .map(|(key, (op, target))| (key.clone(), *op, target.clone()))
            .collect();
        for (key, op, target) in retries {
            if !self.run(&key, op, &target).await {
                return false;
            }
        }
        gauge!("infra_pending_operations", self.pending.len() as f64, "runner" => self.runner.to_string());
        if self.pending.is_empty() {
            self.errors.clear();
        }
        true
    }
}

async fn apply_changes<T: InfraTarget>(
    mut pass: Pass<'_, T>,
    snap: &Snapshot<String, T>,
    prev: Option<&Snapshot<String, T>>,
) -> bool {
    for update in snap.changes_since(prev) {
        let Some(target) = update.value.as_ref() else { continue };
        let op = if update.is_delete { Op::Delete } else { Op::Reconcile };
        if !pass.run(&update.key, op, target).await {
            return false;
        }
    }
    pass.finish().await
}

async fn resync_all<T: InfraTarget>(mut pass: Pass<'_, T>, snap: &Snapshot<String, T>) -> bool {
    debug!(runner = %pass.runner, version = snap.version, entries = snap.len(), pending = pass.pending.len(), "infra resync");
    for (key, target) in &snap.state {
        if !pass.run(key, Op::Reconcile, target).await {
            return false;
        }
    }
    pass.finish().await
}

#[async_trait]
impl<T: InfraTarget> Runner for InfraRunner<T> {
    fn name(&self) -> &str { self.task.name() }

    async fn start(&self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        let name = self.task.name().to_string();
        let input = self.input.clone();
        let infra = Arc::clone(&self.infra);
        let errors = self.task.errors();
        let mut resync_rx = self.resync.subscribe();
        self.task
            .spawn(cancel, move |cancel| async move {
                info!(runner = %name, input = %input.name(), "infrastructure runner started");
                let mut sub = input.subscribe(cancel.clone());
                let mut timer = resync_timer(*resync_rx.borrow_and_update());
                let mut prev: Option<Arc<Snapshot<String, T>>> = None;
                let mut pending = Pending::new();
                loop {
                    let live = tokio::select! {
                        biased;
                        snap = sub.recv() => {
                            let Some(snap) = snap else { break };
                            let pass = Pass::new(&name, &infra, &cancel, &errors, &mut pending);
                            let live = apply_changes(pass, &snap, prev.as_deref()).await;
                            prev = Some(snap);
                            live
                        }
                        Ok(()) = resync_rx.changed() => {
                            timer = resync_timer(*resync_rx.borrow_and_update());
                            true
                        }
                        _ = tick(&mut timer) => match prev.as_deref() {
                            Some(snap) => resync_all(Pass::new(&name, &infra, &cancel, &errors, &mut pending), snap).await,
                            None => true,
                        },
                    };
                    if !live {
                        break;
                    }
                }
                info!(runner = %name, "infrastructure runner finished");
            })
            .await
    }

    async fn shut_down(&self) { self.task.stop().await; }

    async fn reload(&self, config: &ServerConfig) -> Result<(), RunnerError> {
        self.infra.reload(config.clone());
        self.resync.send_replace(resync_period(config));
        Ok(())
    }

    fn last_error(&self) -> Option<String> { self.task.errors().get() }
}
