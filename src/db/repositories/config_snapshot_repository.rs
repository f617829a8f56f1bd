use crate::error::AppError;
use serde_json::Value as JsonValue;
use sqlx::SqlitePool;

/// A configuration snapshot the server believes it handed to a device.
/// `applied` flips when the device acknowledges the matching `request_id`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfigSnapshot {
    pub id: i64,
    pub device_id: String,
    pub request_id: String,
    pub config_json: String,
    pub version: i64,
    pub applied: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ConfigSnapshot {
    pub fn config(&self) -> Result<JsonValue, AppError> {
        serde_json::from_str(&self.config_json)
            .map_err(|e| AppError::Serialization(format!("Corrupt config snapshot: {}", e)))
    }
}

#[derive(Clone)]
pub struct ConfigSnapshotRepository {
    db_pool: SqlitePool,
}

impl ConfigSnapshotRepository {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn save(
        &self,
        device_id: &str,
        request_id: &str,
        config: &JsonValue,
    ) -> Result<i64, AppError> {
        let result = sqlx::query(
            "INSERT INTO device_configs (device_id, request_id, config_json, applied) \
             VALUES (?, ?, ?, 0)",
        )
        .bind(device_id)
        .bind(request_id)
        .bind(config.to_string())
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to save config snapshot: {}", e)))?;

        Ok(result.last_insert_rowid())
    }

    /// Marks the snapshot carrying this request id as applied. Returns false
    /// for an unknown request id (a stale or duplicate ack).
    pub async fn mark_applied(&self, device_id: &str, request_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE device_configs \
             SET applied = 1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
             WHERE device_id = ? AND request_id = ?",
        )
        .bind(device_id)
        .bind(request_id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to mark config applied: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn latest_for_device(
        &self,
        device_id: &str,
    ) -> Result<Option<ConfigSnapshot>, AppError> {
        let row = sqlx::query_as::<_, ConfigSnapshot>(
            "SELECT id, device_id, request_id, config_json, version, applied, created_at, updated_at \
             FROM device_configs WHERE device_id = ? \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch latest config: {}", e)))?;

        Ok(row)
    }
}
