//! User-facing job actions: start a copy, resume one, pause it, inspect it.

use std::sync::Arc;

use foldercopy_core::{FOLDER_MIME_TYPE, FileMetadata, ParentReference};
use thiserror::Error;
use tracing::info;

use crate::copy::{
    COMPLETE_STATUS, Checkpoint, CheckpointError, JobIdentity, RemoteError, RemoteStorage, STOP_KEY,
    TRIGGER_ID_KEY, checkpoint, open_link,
};
use crate::storage::{
    CHECKPOINT_DOCUMENT_TITLE, DocumentStore, JobRecord, KeyValueStore, ProgressSink, Scheduler,
    SqliteStore, StoreError, date_today, timestamp_now,
};

const DEFAULT_DEST_PARENT: &str = "root";

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("no copy job found for folder {0}")]
    NotFound(String),
    #[error("copy into {0} already completed")]
    AlreadyComplete(String),
}

/// What the user picked to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub source_id: String,
    pub dest_name: String,
    pub dest_parent_id: Option<String>,
    pub copy_permissions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedJob {
    pub dest_id: String,
    pub progress_log_id: String,
    pub properties_doc_id: String,
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub identity: JobIdentity,
    pub status: Option<(String, String)>,
    pub rows: Vec<Vec<String>>,
}

pub struct JobService {
    store: SqliteStore,
    documents: Arc<dyn DocumentStore>,
    remote: Arc<dyn RemoteStorage>,
}

impl JobService {
    pub fn new(
        store: SqliteStore,
        documents: Arc<dyn DocumentStore>,
        remote: Arc<dyn RemoteStorage>,
    ) -> Self {
        Self {
            store,
            documents,
            remote,
        }
    }

    /// Creates the destination folder, progress log and checkpoint document, and makes the
    /// new job current. The first slice is left to the caller.
    pub async fn initialize(&self, selection: &Selection) -> Result<StartedJob, JobError> {
        let source = self.remote.get(&selection.source_id).await?;
        let parent_id = selection
            .dest_parent_id
            .clone()
            .or_else(|| source.parents.first().map(|parent| parent.id.clone()))
            .unwrap_or_else(|| DEFAULT_DEST_PARENT.to_string());
        let started_at = timestamp_now();

        let dest = self
            .remote
            .insert(&FileMetadata {
                title: Some(selection.dest_name.clone()),
                description: Some(format!("Copy of {}, created {}", source.title, date_today())),
                mime_type: Some(FOLDER_MIME_TYPE.to_string()),
                parents: vec![ParentReference::file_link(parent_id)],
                labels: None,
            })
            .await?;
        info!(source = %selection.source_id, dest = %dest.id, "created destination folder");

        let progress_log_id = self
            .store
            .create_progress_log(&format!("Copy Folder Log {started_at}"), &dest.id)
            .await?;
        let properties_doc_id = self
            .documents
            .create(CHECKPOINT_DOCUMENT_TITLE, &dest.id)
            .await?;
        let fresh = Checkpoint::fresh(&selection.source_id, &dest.id, selection.copy_permissions);
        checkpoint::save(self.documents.as_ref(), &properties_doc_id, &fresh).await?;

        let previous = JobIdentity::load(&self.store).await?;
        if let Some(trigger_id) = previous.trigger_id {
            self.store.delete_trigger(&trigger_id).await?;
            self.store.remove(TRIGGER_ID_KEY).await?;
        }
        JobIdentity {
            trigger_id: None,
            properties_doc_id: Some(properties_doc_id.clone()),
            progress_log_id: Some(progress_log_id.clone()),
            trials: 0,
            stopped: false,
            source_id: Some(selection.source_id.clone()),
            dest_id: Some(dest.id.clone()),
        }
        .store(&self.store)
        .await?;
        self.store
            .register_job(&JobRecord {
                dest_id: dest.id.clone(),
                source_id: selection.source_id.clone(),
                properties_doc_id: properties_doc_id.clone(),
                progress_log_id: progress_log_id.clone(),
                copy_permissions: selection.copy_permissions,
            })
            .await?;

        self.store
            .progress_log(&progress_log_id)
            .append(&[
                "Destination".to_string(),
                selection.dest_name.clone(),
                open_link(&dest.id),
                dest.id.clone(),
                started_at,
            ])
            .await?;

        Ok(StartedJob {
            dest_id: dest.id,
            progress_log_id,
            properties_doc_id,
        })
    }

    /// Makes an earlier job current again, looked up by its source or destination folder.
    pub async fn resume(&self, folder_id: &str) -> Result<JobRecord, JobError> {
        let record = self
            .store
            .find_job(folder_id)
            .await?
            .ok_or_else(|| JobError::NotFound(folder_id.to_string()))?;
        let finished = self
            .store
            .progress_status(&record.progress_log_id)
            .await?
            .is_some_and(|(status, _)| status == COMPLETE_STATUS);
        if finished {
            return Err(JobError::AlreadyComplete(record.dest_id));
        }

        let previous = JobIdentity::load(&self.store).await?;
        JobIdentity {
            trigger_id: previous.trigger_id,
            properties_doc_id: Some(record.properties_doc_id.clone()),
            progress_log_id: Some(record.progress_log_id.clone()),
            trials: 0,
            stopped: false,
            source_id: Some(record.source_id.clone()),
            dest_id: Some(record.dest_id.clone()),
        }
        .store(&self.store)
        .await?;
        info!(dest = %record.dest_id, "resuming copy");
        Ok(record)
    }

    /// Pauses the current job at its next unit of work.
    pub async fn stop(&self) -> Result<(), JobError> {
        self.store.set(STOP_KEY, "true").await?;
        info!("stop requested");
        Ok(())
    }

    pub async fn status(&self) -> Result<JobStatus, JobError> {
        let identity = JobIdentity::load(&self.store).await?;
        let (status, rows) = match identity.progress_log_id.as_deref() {
            Some(log_id) => (
                self.store.progress_status(log_id).await?,
                self.store.progress_rows(log_id).await?,
            ),
            None => (None, Vec::new()),
        };
        Ok(JobStatus {
            identity,
            status,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::testing::{FakeDrive, ROOT_PARENT, file};
    use crate::copy::{Resolution, SliceOutcome, SliceRunner, SliceSettings};
    use crate::storage::{MemoryDocumentStore, memory_store};

    struct Harness {
        store: SqliteStore,
        docs: Arc<MemoryDocumentStore>,
        drive: Arc<FakeDrive>,
        jobs: JobService,
    }

    async fn harness() -> Harness {
        let store = memory_store().await;
        let docs = Arc::new(MemoryDocumentStore::default());
        let drive = Arc::new(FakeDrive::new("src"));
        drive.add(file("report", "src"));
        let jobs = JobService::new(store.clone(), docs.clone(), drive.clone());
        Harness {
            store,
            docs,
            drive,
            jobs,
        }
    }

    fn selection() -> Selection {
        Selection {
            source_id: "src".into(),
            dest_name: "Copy of src".into(),
            dest_parent_id: None,
            copy_permissions: true,
        }
    }

    #[tokio::test]
    async fn initialize_seeds_everything_a_slice_needs() {
        let h = harness().await;
        let started = h.jobs.initialize(&selection()).await.unwrap();

        let dest = &h.drive.created()[0];
        assert_eq!(dest.id, started.dest_id);
        assert_eq!(dest.metadata.parents[0].id, ROOT_PARENT);
        let description = dest.metadata.description.as_deref().unwrap();
        let date = description.strip_prefix("Copy of src, created ").unwrap();
        assert_eq!(date.len(), "03-05-2024".len());
        assert!(!date.contains(':'));

        let saved = Checkpoint::from_json(&h.docs.content(&started.properties_doc_id).unwrap())
            .unwrap();
        assert_eq!(saved, Checkpoint::fresh("src", &started.dest_id, true));

        let identity = JobIdentity::load(&h.store).await.unwrap();
        assert_eq!(identity.progress_log_id.as_deref(), Some(started.progress_log_id.as_str()));
        assert_eq!(identity.source_id.as_deref(), Some("src"));
        assert!(!identity.stopped);

        let rows = h.store.progress_rows(&started.progress_log_id).await.unwrap();
        assert_eq!(rows[0][0], "Destination");
        assert_eq!(rows[0][3], started.dest_id);
    }

    #[tokio::test]
    async fn explicit_parent_wins() {
        let h = harness().await;
        let picked = Selection {
            dest_parent_id: Some("shared-folder".into()),
            ..selection()
        };
        h.jobs.initialize(&picked).await.unwrap();
        assert_eq!(h.drive.created()[0].metadata.parents[0].id, "shared-folder");
    }

    #[tokio::test]
    async fn initialize_fails_for_unknown_source() {
        let h = harness().await;
        let missing = Selection {
            source_id: "ghost".into(),
            ..selection()
        };
        assert!(matches!(
            h.jobs.initialize(&missing).await,
            Err(JobError::Remote(RemoteError::Permanent(_)))
        ));
        assert!(h.drive.created().is_empty());
    }

    #[tokio::test]
    async fn stop_then_resume_clears_the_flag() {
        let h = harness().await;
        let started = h.jobs.initialize(&selection()).await.unwrap();
        h.jobs.stop().await.unwrap();
        assert!(JobIdentity::load(&h.store).await.unwrap().stopped);

        let record = h.jobs.resume("src").await.unwrap();
        assert_eq!(record.dest_id, started.dest_id);
        let identity = JobIdentity::load(&h.store).await.unwrap();
        assert!(!identity.stopped);
        assert_eq!(identity.trials, 0);
    }

    #[tokio::test]
    async fn resume_unknown_folder_fails() {
        let h = harness().await;
        assert!(matches!(
            h.jobs.resume("nowhere").await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn completed_job_cannot_be_resumed() {
        let h = harness().await;
        let started = h.jobs.initialize(&selection()).await.unwrap();
        let runner = SliceRunner::new(
            h.store.clone(),
            h.docs.clone(),
            h.drive.clone(),
            SliceSettings::default(),
        );
        let outcome = runner.run().await.unwrap();
        assert!(matches!(
            outcome,
            SliceOutcome::Finished {
                resolution: Resolution::Finalized,
                ..
            }
        ));

        assert!(matches!(
            h.jobs.resume(&started.dest_id).await,
            Err(JobError::AlreadyComplete(_))
        ));
        let status = h.jobs.status().await.unwrap();
        assert_eq!(status.status.map(|(s, _)| s).as_deref(), Some(COMPLETE_STATUS));
        assert!(status.rows.iter().any(|row| row[0] == "Copied"));
    }
}
