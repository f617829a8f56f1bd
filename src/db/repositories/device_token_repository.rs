use crate::db::repositories::now_timestamp;
use crate::error::AppError;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceToken {
    pub id: i64,
    pub device_id: String,
    pub token: String,
    pub token_type: String,
    pub expires_at: Option<String>,
    pub last_used: Option<String>,
    pub created_at: String,
}

/// Persistence for pairing and persistent device tokens. Multiple tokens per
/// device may coexist; validation always picks the newest unexpired match.
#[derive(Clone)]
pub struct DeviceTokenRepository {
    db_pool: SqlitePool,
}

impl DeviceTokenRepository {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn insert(
        &self,
        device_id: &str,
        token: &str,
        token_type: &str,
        expires_at: Option<String>,
    ) -> Result<DeviceToken, AppError> {
        let result = sqlx::query(
            "INSERT INTO device_tokens (device_id, token, token_type, expires_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(device_id)
        .bind(token)
        .bind(token_type)
        .bind(&expires_at)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to insert device token: {}", e)))?;

        Ok(DeviceToken {
            id: result.last_insert_rowid(),
            device_id: device_id.to_string(),
            token: token.to_string(),
            token_type: token_type.to_string(),
            expires_at,
            last_used: None,
            created_at: now_timestamp(),
        })
    }

    /// Newest unexpired row matching this exact (device_id, token) pair.
    /// `None` is a normal negative result, never an error.
    pub async fn find_valid(
        &self,
        device_id: &str,
        token: &str,
    ) -> Result<Option<DeviceToken>, AppError> {
        let row = sqlx::query_as::<_, DeviceToken>(
            "SELECT id, device_id, token, token_type, expires_at, last_used, created_at \
             FROM device_tokens \
             WHERE device_id = ? AND token = ? AND (expires_at IS NULL OR expires_at > ?) \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(device_id)
        .bind(token)
        .bind(now_timestamp())
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to validate device token: {}", e)))?;

        Ok(row)
    }

    pub async fn touch_last_used(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE device_tokens SET last_used = ? WHERE id = ?")
            .bind(now_timestamp())
            .bind(id)
            .execute(&self.db_pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to touch device token: {}", e)))?;

        Ok(())
    }

    /// Newest unexpired token of any kind for a device.
    pub async fn active_token(&self, device_id: &str) -> Result<Option<DeviceToken>, AppError> {
        let row = sqlx::query_as::<_, DeviceToken>(
            "SELECT id, device_id, token, token_type, expires_at, last_used, created_at \
             FROM device_tokens \
             WHERE device_id = ? AND (expires_at IS NULL OR expires_at > ?) \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(device_id)
        .bind(now_timestamp())
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch active token: {}", e)))?;

        Ok(row)
    }

    pub async fn revoke(&self, device_id: &str, token: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE device_id = ? AND token = ?")
            .bind(device_id)
            .bind(token)
            .execute(&self.db_pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to revoke device token: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }
}
