use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::storage::{DocumentStore, KeyValueStore, ProgressSink, SqliteStore, StoreError};

use super::backoff::Backoff;
use super::budget::{DEFAULT_MAX_DURATION, ExecutionBudget, StoredStopFlag};
use super::checkpoint;
use super::engine::{CopyEngine, SliceReport};
use super::identity::{JobIdentity, TRIALS_KEY};
use super::remote::{RATE_LIMIT_DELAY, RemoteStorage, RemoteTreeClient};
use super::reschedule::{DEFAULT_RESCHEDULE_AFTER, RescheduleController, Resolution};

pub const MAX_LOAD_TRIALS: u32 = 5;

pub const GIVE_UP_MESSAGE: &str =
    "Error restarting copy. Run 'foldercopyd resume <folder-id>' to continue";

#[derive(Debug, Clone, Copy)]
pub struct SliceSettings {
    pub max_duration: Duration,
    pub reschedule_after: Duration,
    pub load_backoff: Backoff,
    pub rate_limit_delay: Duration,
}

impl Default for SliceSettings {
    fn default() -> Self {
        Self {
            max_duration: DEFAULT_MAX_DURATION,
            reschedule_after: DEFAULT_RESCHEDULE_AFTER,
            load_backoff: Backoff::standard(),
            rate_limit_delay: RATE_LIMIT_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceOutcome {
    /// Nothing is registered as the current job.
    NoJob,
    Finished {
        report: SliceReport,
        resolution: Resolution,
    },
    /// The checkpoint could not be read; `gave_up` once the trial cap was hit.
    LoadFailed { trials: u32, gave_up: bool },
    /// A traversal invariant broke. The job is left paused.
    Aborted(String),
}

#[derive(Debug, Error)]
pub enum SliceError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs one time-boxed slice of the current job.
pub struct SliceRunner {
    store: SqliteStore,
    documents: Arc<dyn DocumentStore>,
    remote: Arc<dyn RemoteStorage>,
    settings: SliceSettings,
}

impl SliceRunner {
    pub fn new(
        store: SqliteStore,
        documents: Arc<dyn DocumentStore>,
        remote: Arc<dyn RemoteStorage>,
        settings: SliceSettings,
    ) -> Self {
        Self {
            store,
            documents,
            remote,
            settings,
        }
    }

    pub async fn run(&self) -> Result<SliceOutcome, SliceError> {
        let kv: Arc<dyn KeyValueStore> = Arc::new(self.store.clone());
        let mut identity = JobIdentity::load(kv.as_ref()).await?;
        let (Some(doc_id), Some(log_id)) = (
            identity.properties_doc_id.clone(),
            identity.progress_log_id.clone(),
        ) else {
            warn!("no current job; nothing to do");
            return Ok(SliceOutcome::NoJob);
        };

        let sink: Arc<dyn ProgressSink> = Arc::new(self.store.progress_log(&log_id));
        let controller = RescheduleController::new(
            kv.clone(),
            Arc::new(self.store.clone()),
            self.documents.clone(),
            sink.clone(),
            self.settings.reschedule_after,
        );
        controller.arm(&mut identity).await?;

        let mut checkpoint = match checkpoint::load_with_backoff(
            self.documents.as_ref(),
            &doc_id,
            &self.settings.load_backoff,
        )
        .await
        {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                error!(doc_id, trials = identity.trials, error = %err, "failed to load checkpoint");
                if identity.trials >= MAX_LOAD_TRIALS {
                    controller.disarm(&mut identity).await?;
                    append(sink.as_ref(), GIVE_UP_MESSAGE).await;
                    return Ok(SliceOutcome::LoadFailed {
                        trials: identity.trials,
                        gave_up: true,
                    });
                }
                identity.trials += 1;
                kv.set(TRIALS_KEY, &identity.trials.to_string()).await?;
                append(sink.as_ref(), &format!("Error loading progress: {err}")).await;
                return Ok(SliceOutcome::LoadFailed {
                    trials: identity.trials,
                    gave_up: false,
                });
            }
        };
        if identity.trials != 0 {
            identity.trials = 0;
            kv.set(TRIALS_KEY, "0").await?;
        }

        let budget = ExecutionBudget::new(
            self.settings.max_duration,
            Arc::new(StoredStopFlag::new(kv.clone())),
        );
        let tree = RemoteTreeClient::new(self.remote.clone())
            .with_rate_limit_delay(self.settings.rate_limit_delay);
        let engine = CopyEngine::new(tree, sink.clone());

        let report = match engine.run(&budget, &mut checkpoint).await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "copy aborted");
                append(sink.as_ref(), &format!("Error, copy aborted: {err}")).await;
                controller.disarm(&mut identity).await?;
                return Ok(SliceOutcome::Aborted(err.to_string()));
            }
        };

        let resolution = controller.finish(&mut identity, &report, &checkpoint).await?;
        info!(?resolution, elapsed_ms = budget.elapsed().as_millis() as u64, "slice settled");
        Ok(SliceOutcome::Finished { report, resolution })
    }
}

async fn append(sink: &dyn ProgressSink, message: &str) {
    if let Err(err) = sink.append(&[message.to_string()]).await {
        warn!(error = %err, "failed to write progress row");
    }
}
