use crate::db::repositories::now_timestamp;
use crate::error::AppError;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecurityKey {
    pub id: i64,
    pub user_id: i64,
    pub key_value: String,
    pub expires_at: String,
    pub created_at: String,
}

/// Per-user short-lived command credentials. Single active key per user:
/// issuing a new key deletes every prior key for that user in the same
/// transaction.
#[derive(Clone)]
pub struct SecurityKeyRepository {
    db_pool: SqlitePool,
}

impl SecurityKeyRepository {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn replace_key(
        &self,
        user_id: i64,
        key_value: &str,
        expires_at: &str,
    ) -> Result<(), AppError> {
        let mut tx = self
            .db_pool
            .begin()
            .await
            .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

        sqlx::query("DELETE FROM security_keys WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Database(format!("Failed to clear security keys: {}", e)))?;

        sqlx::query("INSERT INTO security_keys (user_id, key_value, expires_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(key_value)
            .bind(expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert security key: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Database(format!("Failed to commit security key: {}", e)))?;

        Ok(())
    }

    /// Exact-match, unexpired, newest-row lookup.
    pub async fn validate(&self, user_id: i64, key_value: &str) -> Result<bool, AppError> {
        let row = sqlx::query_as::<_, SecurityKey>(
            "SELECT id, user_id, key_value, expires_at, created_at \
             FROM security_keys \
             WHERE user_id = ? AND key_value = ? AND expires_at > ? \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(key_value)
        .bind(now_timestamp())
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to validate security key: {}", e)))?;

        Ok(row.is_some())
    }
}
