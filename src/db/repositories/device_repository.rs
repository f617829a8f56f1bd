use crate::error::AppError;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

/// Ownership contract: a device may have an owning user. `owner_id = NULL`
/// means any authenticated user may command it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: i64,
    pub device_id: String,
    pub device_name: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub owner_id: Option<i64>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct DeviceRepository {
    db_pool: SqlitePool,
}

impl DeviceRepository {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn get_by_device_id(&self, device_id: &str) -> Result<Option<Device>, AppError> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, device_id, device_name, location, description, owner_id, is_active, \
                    created_at, updated_at \
             FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch device: {}", e)))?;

        Ok(device)
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, AppError> {
        let devices = sqlx::query_as::<_, Device>(
            "SELECT id, device_id, device_name, location, description, owner_id, is_active, \
                    created_at, updated_at \
             FROM devices ORDER BY created_at DESC",
        )
        .fetch_all(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to list devices: {}", e)))?;

        Ok(devices)
    }

    /// Insert or refresh a device record. First contact from an unknown
    /// device creates an unowned row; later identifies keep the name fresh.
    pub async fn upsert_device(
        &self,
        device_id: &str,
        device_name: &str,
        owner_id: Option<i64>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO devices (device_id, device_name, owner_id) VALUES (?, ?, ?) \
             ON CONFLICT (device_id) DO UPDATE SET \
                device_name = excluded.device_name, \
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        )
        .bind(device_id)
        .bind(device_name)
        .bind(owner_id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to upsert device: {}", e)))?;

        Ok(())
    }

    pub async fn set_owner(&self, device_id: &str, owner_id: Option<i64>) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE devices SET owner_id = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
             WHERE device_id = ?",
        )
        .bind(owner_id)
        .bind(device_id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to set device owner: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Device not found: {}", device_id)));
        }

        info!(device_id = %device_id, owner_id = ?owner_id, "Device owner updated");
        Ok(())
    }
}
