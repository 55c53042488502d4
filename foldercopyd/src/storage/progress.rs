use async_trait::async_trait;
use sqlx::Row;
use time::OffsetDateTime;
use time::macros::format_description;

use super::{SqliteStore, StoreError, now_millis};

/// Append-only, ordered record of copy progress.
///
/// Item rows are `[status, title, link, id, timestamp]`; lifecycle rows carry a single message.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn append(&self, row: &[String]) -> Result<(), StoreError>;
    async fn set_status(&self, status: &str, timestamp: &str) -> Result<(), StoreError>;
}

pub fn format_timestamp(at: OffsetDateTime) -> String {
    let format = format_description!(
        "[month]-[day]-[year repr:last_two] [hour repr:12]:[minute]:[second] [period]"
    );
    at.format(format)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

pub fn timestamp_now() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

pub fn format_date(at: OffsetDateTime) -> String {
    let format = format_description!("[month]-[day]-[year]");
    at.format(format)
        .unwrap_or_else(|_| at.date().to_string())
}

pub fn date_today() -> String {
    format_date(OffsetDateTime::now_utc())
}

pub struct SqliteProgressLog {
    store: SqliteStore,
    log_id: String,
}

impl SqliteProgressLog {
    pub fn log_id(&self) -> &str {
        &self.log_id
    }
}

#[async_trait]
impl ProgressSink for SqliteProgressLog {
    async fn append(&self, row: &[String]) -> Result<(), StoreError> {
        let cells = serde_json::to_string(row)?;
        sqlx::query("INSERT INTO progress_rows (log_id, cells, created_at) VALUES (?1, ?2, ?3)")
            .bind(&self.log_id)
            .bind(cells)
            .bind(now_millis())
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    async fn set_status(&self, status: &str, timestamp: &str) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE progress_logs SET status = ?1, status_at = ?2 WHERE id = ?3")
                .bind(status)
                .bind(timestamp)
                .bind(&self.log_id)
                .execute(&self.store.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingLog(self.log_id.clone()));
        }
        Ok(())
    }
}

impl SqliteStore {
    pub async fn create_progress_log(
        &self,
        title: &str,
        folder_id: &str,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO progress_logs (id, title, folder_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&id)
        .bind(title)
        .bind(folder_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub fn progress_log(&self, log_id: &str) -> SqliteProgressLog {
        SqliteProgressLog {
            store: self.clone(),
            log_id: log_id.to_string(),
        }
    }

    pub async fn progress_rows(&self, log_id: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let rows = sqlx::query("SELECT cells FROM progress_rows WHERE log_id = ?1 ORDER BY seq ASC")
            .bind(log_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cells: String = row.try_get("cells")?;
            out.push(serde_json::from_str(&cells)?);
        }
        Ok(out)
    }

    pub async fn progress_status(
        &self,
        log_id: &str,
    ) -> Result<Option<(String, String)>, StoreError> {
        let row = sqlx::query("SELECT status, status_at FROM progress_logs WHERE id = ?1")
            .bind(log_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::MissingLog(log_id.to_string()))?;
        let status: Option<String> = row.try_get("status")?;
        let status_at: Option<String> = row.try_get("status_at")?;
        Ok(status.map(|status| (status, status_at.unwrap_or_default())))
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    rows: std::sync::Mutex<Vec<Vec<String>>>,
    status: std::sync::Mutex<Option<(String, String)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().unwrap().clone()
    }

    pub fn status(&self) -> Option<(String, String)> {
        self.status.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.rows()
            .into_iter()
            .filter(|row| row.len() == 1)
            .map(|mut row| row.remove(0))
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl ProgressSink for MemorySink {
    async fn append(&self, row: &[String]) -> Result<(), StoreError> {
        self.rows.lock().unwrap().push(row.to_vec());
        Ok(())
    }

    async fn set_status(&self, status: &str, timestamp: &str) -> Result<(), StoreError> {
        *self.status.lock().unwrap() = Some((status.to_string(), timestamp.to_string()));
        Ok(())
    }
}
