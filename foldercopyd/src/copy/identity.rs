use crate::storage::{KeyValueStore, StoreError};

pub const TRIGGER_ID_KEY: &str = "triggerId";
pub const PROPERTIES_DOC_ID_KEY: &str = "propertiesDocId";
pub const PROGRESS_LOG_ID_KEY: &str = "progressLogId";
pub const TRIALS_KEY: &str = "trials";
pub const STOP_KEY: &str = "stop";
pub const SOURCE_ID_KEY: &str = "srcId";
pub const DEST_ID_KEY: &str = "destId";

/// Which checkpoint, progress log and reschedule trigger belong to the current job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobIdentity {
    pub trigger_id: Option<String>,
    pub properties_doc_id: Option<String>,
    pub progress_log_id: Option<String>,
    pub trials: u32,
    pub stopped: bool,
    pub source_id: Option<String>,
    pub dest_id: Option<String>,
}

impl JobIdentity {
    pub async fn load(kv: &dyn KeyValueStore) -> Result<Self, StoreError> {
        Ok(Self {
            trigger_id: non_empty(kv.get(TRIGGER_ID_KEY).await?),
            properties_doc_id: non_empty(kv.get(PROPERTIES_DOC_ID_KEY).await?),
            progress_log_id: non_empty(kv.get(PROGRESS_LOG_ID_KEY).await?),
            trials: kv
                .get(TRIALS_KEY)
                .await?
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(0),
            stopped: kv.get(STOP_KEY).await?.as_deref() == Some("true"),
            source_id: non_empty(kv.get(SOURCE_ID_KEY).await?),
            dest_id: non_empty(kv.get(DEST_ID_KEY).await?),
        })
    }

    /// Makes `self` the current job. The trigger id is left to the reschedule controller.
    pub async fn store(&self, kv: &dyn KeyValueStore) -> Result<(), StoreError> {
        set_or_remove(kv, PROPERTIES_DOC_ID_KEY, self.properties_doc_id.as_deref()).await?;
        set_or_remove(kv, PROGRESS_LOG_ID_KEY, self.progress_log_id.as_deref()).await?;
        set_or_remove(kv, SOURCE_ID_KEY, self.source_id.as_deref()).await?;
        set_or_remove(kv, DEST_ID_KEY, self.dest_id.as_deref()).await?;
        kv.set(TRIALS_KEY, &self.trials.to_string()).await?;
        kv.set(STOP_KEY, if self.stopped { "true" } else { "false" })
            .await?;
        Ok(())
    }
}

async fn set_or_remove(
    kv: &dyn KeyValueStore,
    key: &str,
    value: Option<&str>,
) -> Result<(), StoreError> {
    match value {
        Some(value) => kv.set(key, value).await,
        None => kv.remove(key).await,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
