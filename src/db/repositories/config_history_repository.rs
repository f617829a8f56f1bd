use crate::error::AppError;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::SqlitePool;

/// Append-only audit trail of delivery outcomes. Rows are never mutated.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ConfigHistoryEntry {
    pub id: i64,
    pub device_id: String,
    pub user_id: Option<i64>,
    pub action: String,
    pub config_json: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

#[derive(Clone)]
pub struct ConfigHistoryRepository {
    db_pool: SqlitePool,
}

impl ConfigHistoryRepository {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn append(
        &self,
        device_id: &str,
        user_id: Option<i64>,
        action: &str,
        config: Option<&JsonValue>,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO config_history (device_id, user_id, action, config_json, error_message) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(device_id)
        .bind(user_id)
        .bind(action)
        .bind(config.map(|c| c.to_string()))
        .bind(error_message)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to append config history: {}", e)))?;

        Ok(())
    }

    pub async fn list_for_device(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<ConfigHistoryEntry>, AppError> {
        let rows = sqlx::query_as::<_, ConfigHistoryEntry>(
            "SELECT id, device_id, user_id, action, config_json, error_message, created_at \
             FROM config_history WHERE device_id = ? \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch config history: {}", e)))?;

        Ok(rows)
    }
}
