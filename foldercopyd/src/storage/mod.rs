mod documents;
mod jobs;
mod progress;
mod properties;
mod triggers;

use std::path::Path;

use sqlx::{SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use time::OffsetDateTime;

pub use documents::{
    CHECKPOINT_DOCUMENT_TITLE, DocumentStore, LocalDocumentStore, RemoteDocumentStore,
};
pub use jobs::JobRecord;
pub use progress::{
    ProgressSink, SqliteProgressLog, date_today, format_date, format_timestamp, timestamp_now,
};
pub use properties::KeyValueStore;
pub use triggers::Scheduler;

#[cfg(test)]
pub use documents::MemoryDocumentStore;
#[cfg(test)]
pub use progress::MemorySink;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote error: {0}")]
    Remote(#[from] foldercopy_core::DriveError),
    #[error("invalid progress row: {0}")]
    InvalidRow(#[from] serde_json::Error),
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),
    #[error("progress log not found: {0}")]
    MissingLog(String),
}

/// Job identity, reschedule triggers, progress logs and the job registry live in one sqlite file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
pub(crate) async fn memory_store() -> SqliteStore {
    // Every connection to `sqlite::memory:` is its own database, so keep exactly one alive.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteStore::from_pool(pool);
    store.init().await.unwrap();
    store
}
