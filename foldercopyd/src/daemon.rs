use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use foldercopy_core::DriveClient;
use tracing::{error, info, warn};

use crate::copy::{
    Backoff, DEFAULT_MAX_DURATION, DEFAULT_RESCHEDULE_AFTER, RATE_LIMIT_DELAY, RemoteStorage,
    SliceOutcome, SliceRunner, SliceSettings, TRIGGER_ID_KEY,
};
use crate::job::JobService;
use crate::storage::{
    DocumentStore, KeyValueStore, LocalDocumentStore, RemoteDocumentStore, Scheduler, SqliteStore,
};

const DEFAULT_API_BASE: &str = "https://www.googleapis.com";
const DEFAULT_STATE_DIR_NAME: &str = "foldercopy";
const DATABASE_FILE: &str = "foldercopy.db";
const DEFAULT_POLL_MS: u64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointBackend {
    /// Plain-text document next to the copy in the destination folder.
    Remote,
    /// Files under the state directory.
    Local,
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub token: Option<String>,
    pub api_base: String,
    pub state_dir: PathBuf,
    pub max_slice: Duration,
    pub reschedule_after: Duration,
    pub poll_interval: Duration,
    pub checkpoint_backend: CheckpointBackend,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let state_dir = match lookup("FOLDERCOPY_STATE_DIR") {
            Some(value) => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            None => default_state_dir(),
        };
        let token = lookup("FOLDERCOPY_TOKEN").filter(|token| !token.trim().is_empty());
        let api_base = lookup("FOLDERCOPY_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let max_slice = Duration::from_secs(read_u64(
            &lookup,
            "FOLDERCOPY_MAX_SLICE_SECS",
            DEFAULT_MAX_DURATION.as_secs(),
        ));
        let reschedule_after = Duration::from_secs(read_u64(
            &lookup,
            "FOLDERCOPY_RESCHEDULE_SECS",
            DEFAULT_RESCHEDULE_AFTER.as_secs(),
        ));
        let poll_interval =
            Duration::from_millis(read_u64(&lookup, "FOLDERCOPY_POLL_MS", DEFAULT_POLL_MS));
        let checkpoint_backend = read_backend(lookup("FOLDERCOPY_CHECKPOINT_BACKEND").as_deref())?;

        Ok(Self {
            token,
            api_base,
            state_dir,
            max_slice,
            reschedule_after,
            poll_interval,
            checkpoint_backend,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join(DATABASE_FILE)
    }

    pub fn slice_settings(&self) -> SliceSettings {
        SliceSettings {
            max_duration: self.max_slice,
            reschedule_after: self.reschedule_after,
            load_backoff: Backoff::standard(),
            rate_limit_delay: RATE_LIMIT_DELAY,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: SqliteStore,
    documents: Arc<dyn DocumentStore>,
    remote: Arc<dyn RemoteStorage>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .with_context(|| format!("failed to create state dir at {:?}", config.state_dir))?;
        let store = SqliteStore::open(&config.database_path())
            .await
            .context("failed to initialize state database")?;

        let token = match &config.token {
            Some(token) => token.clone(),
            None => {
                warn!("FOLDERCOPY_TOKEN is not set; remote calls will be rejected");
                String::new()
            }
        };
        let client = DriveClient::with_base_url(&config.api_base, token)
            .context("invalid FOLDERCOPY_API_BASE")?;
        let documents = build_document_store(&config, &client);

        Ok(Self {
            config,
            store,
            documents,
            remote: Arc::new(client),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn jobs(&self) -> JobService {
        JobService::new(
            self.store.clone(),
            self.documents.clone(),
            self.remote.clone(),
        )
    }

    pub fn slice_runner(&self) -> SliceRunner {
        SliceRunner::new(
            self.store.clone(),
            self.documents.clone(),
            self.remote.clone(),
            self.config.slice_settings(),
        )
    }

    pub async fn run_slice(&self) -> anyhow::Result<SliceOutcome> {
        let outcome = self
            .slice_runner()
            .run()
            .await
            .context("slice failed")?;
        info!(outcome = %describe_outcome(&outcome), "slice done");
        Ok(outcome)
    }

    /// Runs a slice if a trigger has come due.
    pub async fn poll_once(&self) -> anyhow::Result<Option<SliceOutcome>> {
        let Some(trigger_id) = self
            .store
            .take_due_trigger(crate::storage::now_millis())
            .await
            .context("failed to read triggers")?
        else {
            return Ok(None);
        };
        info!(trigger_id, "trigger fired");
        match self.run_slice().await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) => {
                // The fired trigger is gone; put one back so the job is not stranded.
                self.rearm_after_failure().await;
                Err(err)
            }
        }
    }

    async fn rearm_after_failure(&self) {
        let trigger_id = match self.store.create_trigger(self.config.reschedule_after).await {
            Ok(trigger_id) => trigger_id,
            Err(err) => {
                error!(error = %err, "failed to re-arm trigger after slice error");
                return;
            }
        };
        if let Err(err) = self.store.set(TRIGGER_ID_KEY, &trigger_id).await {
            warn!(trigger_id, error = %err, "re-armed trigger is not recorded on the job");
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            state_dir = %self.config.state_dir.display(),
            backend = ?self.config.checkpoint_backend,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "foldercopyd started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    info!("shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        error!(error = %format!("{err:#}"), "trigger poll failed");
                    }
                }
            }
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
