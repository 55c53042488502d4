use sqlx::Row;

use super::{SqliteStore, StoreError, now_millis};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub dest_id: String,
    pub source_id: String,
    pub properties_doc_id: String,
    pub progress_log_id: String,
    pub copy_permissions: bool,
}

impl SqliteStore {
    pub async fn register_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs (dest_id, source_id, properties_doc_id, progress_log_id, copy_permissions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(dest_id) DO UPDATE SET
                source_id = excluded.source_id,
                properties_doc_id = excluded.properties_doc_id,
                progress_log_id = excluded.progress_log_id,
                copy_permissions = excluded.copy_permissions",
        )
        .bind(&job.dest_id)
        .bind(&job.source_id)
        .bind(&job.properties_doc_id)
        .bind(&job.progress_log_id)
        .bind(job.copy_permissions)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent job whose destination or source folder is `folder_id`.
    pub async fn find_job(&self, folder_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT dest_id, source_id, properties_doc_id, progress_log_id, copy_permissions
             FROM jobs
             WHERE dest_id = ?1 OR source_id = ?1
             ORDER BY dest_id = ?1 DESC, created_at DESC
             LIMIT 1",
        )
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(JobRecord {
            dest_id: row.try_get("dest_id")?,
            source_id: row.try_get("source_id")?,
            properties_doc_id: row.try_get("properties_doc_id")?,
            progress_log_id: row.try_get("progress_log_id")?,
            copy_permissions: row.try_get("copy_permissions")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store;

    fn record(dest: &str, source: &str) -> JobRecord {
        JobRecord {
            dest_id: dest.into(),
            source_id: source.into(),
            properties_doc_id: format!("doc-{dest}"),
            progress_log_id: format!("log-{dest}"),
            copy_permissions: true,
        }
    }

    #[tokio::test]
    async fn finds_job_by_destination_or_source() {
        let store = memory_store().await;
        store.register_job(&record("dest-1", "src-1")).await.unwrap();

        let by_dest = store.find_job("dest-1").await.unwrap().unwrap();
        let by_source = store.find_job("src-1").await.unwrap().unwrap();
        assert_eq!(by_dest, by_source);
        assert!(by_dest.copy_permissions);
        assert_eq!(store.find_job("other").await.unwrap(), None);
    }
}
