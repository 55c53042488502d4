use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::storage::{
    DocumentStore, KeyValueStore, ProgressSink, Scheduler, StoreError, timestamp_now,
};

use super::checkpoint::{self, Checkpoint};
use super::engine::{SliceReport, TerminalReason};
use super::identity::{JobIdentity, TRIGGER_ID_KEY};

/// Longer than one slice so two slices never overlap.
pub const DEFAULT_RESCHEDULE_AFTER: Duration = Duration::from_millis(372_000);

pub const STOPPED_MESSAGE: &str =
    "Stopped manually by user. Please use 'resume' to restart copying";
pub const PAUSED_MESSAGE: &str =
    "Paused due to quota limits - copying will resume automatically in a few minutes";
pub const COMPLETE_STATUS: &str = "Complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The trigger armed at slice start stays in place.
    Rescheduled,
    /// No further slice will run until the job is resumed.
    Halted,
    Finalized,
}

pub struct RescheduleController {
    kv: Arc<dyn KeyValueStore>,
    scheduler: Arc<dyn Scheduler>,
    documents: Arc<dyn DocumentStore>,
    sink: Arc<dyn ProgressSink>,
    after: Duration,
}

impl RescheduleController {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        scheduler: Arc<dyn Scheduler>,
        documents: Arc<dyn DocumentStore>,
        sink: Arc<dyn ProgressSink>,
        after: Duration,
    ) -> Self {
        Self {
            kv,
            scheduler,
            documents,
            sink,
            after,
        }
    }

    /// Replaces any pending trigger with a fresh one so at most one future slice is armed.
    pub async fn arm(&self, identity: &mut JobIdentity) -> Result<String, StoreError> {
        if let Some(previous) = identity.trigger_id.take() {
            self.scheduler.delete_trigger(&previous).await?;
        }
        let trigger_id = self.scheduler.create_trigger(self.after).await?;
        self.kv.set(TRIGGER_ID_KEY, &trigger_id).await?;
        info!(trigger_id, after_secs = self.after.as_secs(), "armed reschedule trigger");
        identity.trigger_id = Some(trigger_id.clone());
        Ok(trigger_id)
    }

    pub async fn disarm(&self, identity: &mut JobIdentity) -> Result<(), StoreError> {
        if let Some(trigger_id) = identity.trigger_id.take() {
            self.scheduler.delete_trigger(&trigger_id).await?;
            info!(trigger_id, "disarmed reschedule trigger");
        }
        self.kv.remove(TRIGGER_ID_KEY).await
    }

    /// Settles the slice: persists or discards the checkpoint and decides whether the job
    /// runs again on its own.
    pub async fn finish(
        &self,
        identity: &mut JobIdentity,
        report: &SliceReport,
        checkpoint: &Checkpoint,
    ) -> Result<Resolution, StoreError> {
        let doc_id = identity.properties_doc_id.clone().unwrap_or_default();

        if report.reason == TerminalReason::Completed {
            if let Err(err) = self.documents.trash(&doc_id).await {
                warn!(doc_id, error = %err, "failed to trash checkpoint document");
            }
            self.disarm(identity).await?;
            let finished_at = timestamp_now();
            self.append(&["Copy complete".to_string()]).await;
            self.sink.set_status(COMPLETE_STATUS, &finished_at).await?;
            info!(copied = report.copied, failed = report.failed, "copy complete");
            return Ok(Resolution::Finalized);
        }

        if let Err(err) = checkpoint::save(self.documents.as_ref(), &doc_id, checkpoint).await {
            error!(doc_id, error = %err, "failed to save checkpoint");
            self.append(&[format!("Error saving progress: {err}")]).await;
            return Ok(Resolution::Rescheduled);
        }

        match &report.reason {
            TerminalReason::Stopped => {
                self.append(&[STOPPED_MESSAGE.to_string()]).await;
                self.disarm(identity).await?;
                Ok(Resolution::Halted)
            }
            TerminalReason::TimedOut => {
                self.append(&[PAUSED_MESSAGE.to_string()]).await;
                Ok(Resolution::Rescheduled)
            }
            TerminalReason::Interrupted(message) => {
                self.append(&[format!(
                    "Paused after error: {message}. Copying will resume automatically"
                )])
                .await;
                Ok(Resolution::Rescheduled)
            }
            TerminalReason::Completed => Ok(Resolution::Finalized),
        }
    }

    async fn append(&self, row: &[String]) {
        if let Err(err) = self.sink.append(row).await {
            warn!(error = %err, "failed to write progress row");
        }
    }
}
