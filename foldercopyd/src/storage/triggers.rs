use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;

use super::{SqliteStore, StoreError, now_millis};

/// One-shot "run the job again after a delay" facility.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn create_trigger(&self, after: Duration) -> Result<String, StoreError>;
    async fn delete_trigger(&self, trigger_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl Scheduler for SqliteStore {
    async fn create_trigger(&self, after: Duration) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let after_ms = after.as_millis().min(i64::MAX as u128) as i64;
        sqlx::query("INSERT INTO triggers (id, fire_at) VALUES (?1, ?2)")
            .bind(&id)
            .bind(now_millis().saturating_add(after_ms))
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn delete_trigger(&self, trigger_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM triggers WHERE id = ?1")
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl SqliteStore {
    /// Removes and returns the earliest trigger whose fire time has passed.
    pub async fn take_due_trigger(&self, now_ms: i64) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id FROM triggers WHERE fire_at <= ?1 ORDER BY fire_at ASC LIMIT 1",
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: String = row.try_get("id")?;
        sqlx::query("DELETE FROM triggers WHERE id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(id))
    }

    pub async fn pending_triggers(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query("SELECT id, fire_at FROM triggers ORDER BY fire_at ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("id")?, row.try_get("fire_at")?));
        }
        Ok(out)
    }
}
