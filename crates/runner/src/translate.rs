use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tollgate_store::{Snapshot, SnapshotStore};
use tracing::{debug, info, warn};

use crate::task::TaskSlot;
use crate::{Runner, RunnerError};

type TranslateFn<KI, VI, KO, VO> = dyn Fn(&Snapshot<KI, VI>) -> Result<BTreeMap<KO, VO>, RunnerError> + Send + Sync;

/// Turns every snapshot of one store into the complete contents of another.
///
/// Each output is published as a single version, so downstream consumers
/// never see half a translation. A failed translation is logged and the
/// output keeps its previous contents.
pub struct TranslateRunner<KI, VI, KO, VO> {
    task: TaskSlot,
    input: SnapshotStore<KI, VI>,
    output: SnapshotStore<KO, VO>,
    translate: Arc<TranslateFn<KI, VI, KO, VO>>,
}

impl<KI, VI, KO, VO> TranslateRunner<KI, VI, KO, VO>
where
    KI: Ord + Clone + Debug + Send + Sync + 'static,
    VI: Clone + Send + Sync + 'static,
    KO: Ord + Clone + Debug + Send + Sync + 'static,
    VO: Clone + Send + Sync + 'static,
{
    pub fn new<F>(name: impl Into<String>, input: SnapshotStore<KI, VI>, output: SnapshotStore<KO, VO>, translate: F) -> Self
    where
        F: Fn(&Snapshot<KI, VI>) -> Result<BTreeMap<KO, VO>, RunnerError> + Send + Sync + 'static,
    {
        Self { task: TaskSlot::new(name), input, output, translate: Arc::new(translate) }
    }
}

#[async_trait]
impl<KI, VI, KO, VO> Runner for TranslateRunner<KI, VI, KO, VO>
where
    KI: Ord + Clone + Debug + Send + Sync + 'static,
    VI: Clone + Send + Sync + 'static,
    KO: Ord + Clone + Debug + Send + Sync + 'static,
    VO: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str { self.task.name() }

    async fn start(&self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        let name = self.task.name().to_string();
        let input = self.input.clone();
        let output = self.output.clone();
        let translate = Arc::clone(&self.translate);
        let errors = self.task.errors();
        self.task
            .spawn(cancel, move |cancel| async move {
                info!(runner = %name, input = %input.name(), output = %output.name(), "translate runner started");
                let mut sub = input.subscribe(cancel);
                while let Some(snap) = sub.recv().await {
                    let result = match translate(snap.as_ref()) {
                        Ok(next) => output.replace_all(next).map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    };
                    match result {
                        Ok(version) => {
                            errors.clear();
                            debug!(runner = %name, input_version = snap.version, output_version = version, "translated snapshot");
                        }
                        Err(e) => {
                            counter!("runner_errors_total", 1, "runner" => name.clone());
                            warn!(runner = %name, input_version = snap.version, error = %e, "translation skipped");
                            errors.record(e);
                        }
                    }
                    if output.is_closed() {
                        break;
                    }
                }
                info!(runner = %name, "translate runner finished");
            })
            .await
    }

    async fn shut_down(&self) { self.task.stop().await; }

    fn last_error(&self) -> Option<String> { self.task.errors().get() }
}
