//! Tollgate apply: create-or-update with optimistic-concurrency retry, delete
//! and owner UID lookup over a [`ClusterApi`].

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tollgate_core::{OwnerRef, RetryConfig};
use tollgate_kubehub::{ClusterApi, ClusterError, ManagedKind, ManagedObject, ObjectKey};
use tracing::{debug, info, warn};

/// Bounded exponential backoff for conflict retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::from(&RetryConfig::default()) }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            initial_backoff: Duration::from_millis(c.initial_backoff_ms),
            max_backoff: Duration::from_millis(c.max_backoff_ms),
            factor: c.factor.max(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut d = self.initial_backoff;
        for _ in 1..attempt {
            d = d.saturating_mul(self.factor);
            if d >= self.max_backoff {
                break;
            }
        }
        d.min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Create,
    Update,
    Delete,
    GetUid,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::GetUid => "get_uid",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("{operation:?} {kind} {key}: {source}")]
    Cluster {
        kind: ManagedKind,
        key: ObjectKey,
        operation: Operation,
        #[source]
        source: ClusterError,
    },
    #[error("gave up after {attempts} conflicting attempts: {last}")]
    ConflictRetriesExhausted { attempts: u32, last: Box<ApplyError> },
    #[error("{kind} {key}: {detail}; delete the object to let it be recreated with the new value")]
    ImmutableField { kind: ManagedKind, key: ObjectKey, detail: String },
    #[error("owner {kind} {name} not found")]
    OwnerNotFound { kind: String, name: String },
    #[error("owner {kind} {name}: {source}")]
    OwnerLookup {
        kind: String,
        name: String,
        #[source]
        source: ClusterError,
    },
}

impl ApplyError {
    /// Whether a fresh fetch followed by another attempt may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApplyError::Cluster { source, .. } if source.is_conflict())
    }

    fn cluster(kind: ManagedKind, key: &ObjectKey, operation: Operation, source: ClusterError) -> Self {
        ApplyError::Cluster { kind, key: key.clone(), operation, source }
    }
}

/// Run `op` until it succeeds, fails with something other than a conflict, or
/// `policy.max_attempts` is reached. Backoff sleeps race `cancel`.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ApplyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApplyError>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(ApplyError::Cancelled);
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_conflict() => {
                if attempt >= policy.max_attempts {
                    return Err(ApplyError::ConflictRetriesExhausted { attempts: attempt, last: Box::new(e) });
                }
                let delay = policy.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "conflict, retrying");
                counter!("resource_conflict_retries_total", 1);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ApplyError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<Result<T, ClusterError>, ApplyError>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ApplyError::Cancelled),
        r = fut => Ok(r),
    }
}

/// What `create_or_update` should do with a live object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateDecision {
    pub write: bool,
    /// An immutable field that could not be changed; reported after writing.
    pub violation: Option<String>,
}

impl UpdateDecision {
    pub fn write() -> Self { Self { write: true, violation: None } }

    pub fn skip() -> Self { Self::default() }

    pub fn with_violation(mut self, detail: impl Into<String>) -> Self {
        self.violation = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Every write to the cluster goes through here.
#[derive(Clone)]
pub struct InfraClient {
    cluster: Arc<dyn ClusterApi>,
    retry: RetryPolicy,
}

impl InfraClient {
    pub fn new(cluster: Arc<dyn ClusterApi>, retry: RetryPolicy) -> Self { Self { cluster, retry } }

    pub fn with_retry(&self, retry: RetryPolicy) -> Self { Self { cluster: self.cluster.clone(), retry } }

    pub fn retry_policy(&self) -> &RetryPolicy { &self.retry }

    /// Create `desired` when absent; otherwise let `prepare` inspect the live
    /// object and adjust the object to write, then update it under the live
    /// identity. Conflicts re-run the whole fetch-and-mutate step.
    pub async fn create_or_update<P>(
        &self,
        desired: &ManagedObject,
        prepare: P,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ApplyError>
    where
        P: Fn(&ManagedObject, &mut ManagedObject) -> UpdateDecision + Sync,
    {
        let kind = desired.kind();
        let key = desired.key();
        let started = Instant::now();
        let (key_ref, prepare_ref) = (&key, &prepare);

        let res = retry_on_conflict(&self.retry, cancel, || async move {
            let live = cancellable(cancel, self.cluster.get(kind, key_ref))
                .await?
                .map_err(|e| ApplyError::cluster(kind, key_ref, Operation::Get, e))?;
            match live {
                None => {
                    cancellable(cancel, self.cluster.create(desired))
                        .await?
                        .map_err(|e| ApplyError::cluster(kind, key_ref, Operation::Create, e))?;
                    Ok((ApplyOutcome::Created, None))
                }
                Some(live) => {
                    let mut next = desired.clone();
                    let decision = prepare_ref(&live, &mut next);
                    if !decision.write {
                        return Ok((ApplyOutcome::Unchanged, decision.violation));
                    }
                    next.adopt_identity(&live);
                    cancellable(cancel, self.cluster.update(&next))
                        .await?
                        .map_err(|e| ApplyError::cluster(kind, key_ref, Operation::Update, e))?;
                    Ok((ApplyOutcome::Updated, decision.violation))
                }
            }
        })
        .await;

        histogram!("resource_apply_duration_seconds", started.elapsed().as_secs_f64(), "kind" => kind.as_str());
        match res {
            Ok((outcome, violation)) => {
                match outcome {
                    ApplyOutcome::Created => {
                        record("resources_created_total", kind, &key);
                        info!(kind = %kind, key = %key, "created");
                    }
                    ApplyOutcome::Updated => {
                        record("resources_updated_total", kind, &key);
                        info!(kind = %kind, key = %key, "updated");
                    }
                    ApplyOutcome::Unchanged => debug!(kind = %kind, key = %key, "unchanged"),
                }
                match violation {
                    Some(detail) => {
                        let err = ApplyError::ImmutableField { kind, key: key.clone(), detail };
                        record_error(kind, &key, Operation::Update);
                        warn!(error = %err, "incompatible update skipped");
                        Err(err)
                    }
                    None => Ok(outcome),
                }
            }
            Err(e) => {
                if !matches!(e, ApplyError::Cancelled) {
                    record_error(kind, &key, failed_operation(&e));
                }
                Err(e)
            }
        }
    }

    /// Delete by key. `Ok(false)` when the object was already absent.
    pub async fn delete(&self, kind: ManagedKind, key: &ObjectKey, cancel: &CancellationToken) -> Result<bool, ApplyError> {
        match cancellable(cancel, self.cluster.delete(kind, key)).await? {
            Ok(()) => {
                record("resources_deleted_total", kind, key);
                info!(kind = %kind, key = %key, "deleted");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => {
                record_error(kind, key, Operation::Delete);
                Err(ApplyError::cluster(kind, key, Operation::Delete, e))
            }
        }
    }

    pub async fn get_uid(&self, owner: &OwnerRef, cancel: &CancellationToken) -> Result<String, ApplyError> {
        match cancellable(cancel, self.cluster.get_uid(owner)).await? {
            Ok(Some(uid)) => Ok(uid),
            Ok(None) => Err(ApplyError::OwnerNotFound { kind: owner.kind.clone(), name: owner.name.clone() }),
            Err(source) => {
                counter!("resources_errors_total", 1,
                    "kind" => owner.kind.clone(),
                    "namespace" => owner.namespace.clone().unwrap_or_default(),
                    "name" => owner.name.clone(),
                    "operation" => Operation::GetUid.as_str());
                Err(ApplyError::OwnerLookup { kind: owner.kind.clone(), name: owner.name.clone(), source })
            }
        }
    }
}

fn failed_operation(e: &ApplyError) -> Operation {
    match e {
        ApplyError::Cluster { operation, .. } => *operation,
        ApplyError::ConflictRetriesExhausted { last, .. } => failed_operation(last),
        _ => Operation::Update,
    }
}

fn record(name: &'static str, kind: ManagedKind, key: &ObjectKey) {
    counter!(name, 1,
        "kind" => kind.as_str(),
        "namespace" => key.namespace.clone(),
        "name" => key.name.clone());
}

fn record_error(kind: ManagedKind, key: &ObjectKey, operation: Operation) {
    counter!("resources_errors_total", 1,
        "kind" => kind.as_str(),
        "namespace" => key.namespace.clone(),
        "name" => key.name.clone(),
        "operation" => operation.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> ApplyError {
        ApplyError::cluster(ManagedKind::ConfigMap, &ObjectKey::new("ns", "x"), Operation::Update, ClusterError::Conflict("stale".into()))
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, initial_backoff: Duration::from_millis(1), max_backoff: Duration::from_millis(2), factor: 2 }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.backoff(1), Duration::from_millis(10));
        assert_eq!(p.backoff(2), Duration::from_millis(20));
        assert_eq!(p.backoff(4), Duration::from_millis(80));
        assert_eq!(p.backoff(30), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let out = retry_on_conflict(&fast(5), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err(conflict()) } else { Ok(n) } }
        })
        .await
        .expect("succeeds on third attempt");
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = retry_on_conflict(&fast(3), &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(conflict()) }
        })
        .await
        .expect_err("never succeeds");
        assert!(matches!(err, ApplyError::ConflictRetriesExhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_on_conflict(&fast(5), &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ApplyError::OwnerNotFound { kind: "Gateway".into(), name: "g".into() }) }
        })
        .await
        .expect_err("fails");
        assert!(matches!(err, ApplyError::OwnerNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy { max_attempts: 10, initial_backoff: Duration::from_secs(30), max_backoff: Duration::from_secs(30), factor: 1 };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let res = tokio::time::timeout(
            Duration::from_secs(2),
            retry_on_conflict(&policy, &cancel, || async { Err::<(), _>(conflict()) }),
        )
        .await
        .expect("returned promptly");
        assert!(matches!(res, Err(ApplyError::Cancelled)));
    }
}
