use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::RunnerError;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The one background task a runner owns.
pub(crate) struct TaskSlot {
    name: String,
    running: tokio::sync::Mutex<Option<Running>>,
    errors: LastError,
}

impl TaskSlot {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), running: tokio::sync::Mutex::new(None), errors: LastError::default() }
    }

    pub(crate) fn name(&self) -> &str { &self.name }

    /// Spawn `work` with a token that fires on `parent` cancellation or on
    /// [`TaskSlot::stop`].
    pub(crate) async fn spawn<F, Fut>(&self, parent: &CancellationToken, work: F) -> Result<(), RunnerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.running.lock().await;
        if slot.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(RunnerError::AlreadyRunning(self.name.clone()));
        }
        let cancel = parent.child_token();
        let handle = tokio::spawn(work(cancel.clone()));
        *slot = Some(Running { cancel, handle });
        debug!(runner = %self.name, "task spawned");
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else { return };
        running.cancel.cancel();
        match running.handle.await {
            Ok(()) => debug!(runner = %self.name, "task stopped"),
            Err(e) if e.is_panic() => warn!(runner = %self.name, "task panicked"),
            Err(_) => {}
        }
    }

    /// Shared with the task so it can report failed passes.
    pub(crate) fn errors(&self) -> LastError { self.errors.clone() }
}

#[derive(Clone, Default)]
pub(crate) struct LastError(Arc<Mutex<Option<String>>>);

impl LastError {
    pub(crate) fn record(&self, err: impl Into<String>) { *self.lock() = Some(err.into()); }

    pub(crate) fn clear(&self) { *self.lock() = None; }

    pub(crate) fn get(&self) -> Option<String> { self.lock().clone() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}
