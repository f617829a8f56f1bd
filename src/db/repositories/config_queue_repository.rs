use crate::db::repositories::now_timestamp;
use crate::error::AppError;
use serde_json::Value as JsonValue;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfigQueueEntry {
    pub id: i64,
    pub device_id: String,
    pub payload: String,
    pub status: String,
    pub retries: i64,
    pub max_retries: i64,
    pub last_try: Option<String>,
    pub created_at: String,
}

impl ConfigQueueEntry {
    pub fn payload_json(&self) -> Result<JsonValue, AppError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| AppError::Serialization(format!("Corrupt queue payload: {}", e)))
    }
}

/// Durable delivery obligations. The retry worker and the handshake flush
/// both finalize entries, so every state change is a conditional update
/// guarded by `status = 'pending'`; whoever flips the row first wins and the
/// loser sees zero affected rows.
#[derive(Clone)]
pub struct ConfigQueueRepository {
    db_pool: SqlitePool,
}

impl ConfigQueueRepository {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn enqueue(
        &self,
        device_id: &str,
        payload: &JsonValue,
        max_retries: i64,
    ) -> Result<i64, AppError> {
        let result = sqlx::query(
            "INSERT INTO config_queue (device_id, payload, max_retries, status) \
             VALUES (?, ?, ?, 'pending')",
        )
        .bind(device_id)
        .bind(payload.to_string())
        .bind(max_retries)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to enqueue config: {}", e)))?;

        Ok(result.last_insert_rowid())
    }

    /// Oldest-first batch of pending entries; the limit time-boxes a worker
    /// tick.
    pub async fn pending(&self, limit: i64) -> Result<Vec<ConfigQueueEntry>, AppError> {
        let rows = sqlx::query_as::<_, ConfigQueueEntry>(
            "SELECT id, device_id, payload, status, retries, max_retries, last_try, created_at \
             FROM config_queue WHERE status = 'pending' \
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch pending queue: {}", e)))?;

        Ok(rows)
    }

    pub async fn pending_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<ConfigQueueEntry>, AppError> {
        let rows = sqlx::query_as::<_, ConfigQueueEntry>(
            "SELECT id, device_id, payload, status, retries, max_retries, last_try, created_at \
             FROM config_queue WHERE status = 'pending' AND device_id = ? \
             ORDER BY created_at ASC",
        )
        .bind(device_id)
        .fetch_all(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch device queue: {}", e)))?;

        Ok(rows)
    }

    pub async fn get(&self, id: i64) -> Result<Option<ConfigQueueEntry>, AppError> {
        let row = sqlx::query_as::<_, ConfigQueueEntry>(
            "SELECT id, device_id, payload, status, retries, max_retries, last_try, created_at \
             FROM config_queue WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch queue entry: {}", e)))?;

        Ok(row)
    }

    /// Returns true when this caller won the transition.
    pub async fn mark_sent(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE config_queue SET status = 'sent', last_try = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now_timestamp())
        .bind(id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to mark queue entry sent: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal transition. Once failed an entry is never retried, only
    /// purged after the retention window.
    pub async fn mark_failed(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE config_queue SET status = 'failed', last_try = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now_timestamp())
        .bind(id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to mark queue entry failed: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts a failed attempt. The `retries < max_retries` guard keeps the
    /// retry counter within its invariant even if two paths race.
    pub async fn record_attempt(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE config_queue SET retries = retries + 1, last_try = ? \
             WHERE id = ? AND status = 'pending' AND retries < max_retries",
        )
        .bind(now_timestamp())
        .bind(id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to record queue attempt: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Garbage-collects failed entries older than the cutoff.
    pub async fn purge_failed_before(&self, cutoff: &str) -> Result<u64, AppError> {
        let result =
            sqlx::query("DELETE FROM config_queue WHERE status = 'failed' AND created_at < ?")
                .bind(cutoff)
                .execute(&self.db_pool)
                .await
                .map_err(|e| AppError::Database(format!("Failed to purge queue: {}", e)))?;

        Ok(result.rows_affected())
    }
}
