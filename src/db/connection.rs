use crate::error::AppError;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

/// Creates the SQLite connection pool and brings the schema up to date.
///
/// The database file is created on first start (`mode=rwc` in the default
/// URL). Retries a few times so a slow volume mount does not kill the
/// process on boot.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, AppError> {
    info!(url = %database_url, "Creating database connection pool");

    let max_retries = 3;
    let mut last_error = None;

    for attempt in 1..=max_retries {
        match SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .map_err(|e| AppError::Database(format!("Migration failed: {}", e)))?;
                info!("Database ready");
                return Ok(pool);
            }
            Err(e) => {
                warn!(attempt, error = %e, "Database connection attempt failed");
                last_error = Some(e);
                if attempt < max_retries {
                    tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                }
            }
        }
    }

    let error = last_error
        .unwrap_or_else(|| sqlx::Error::Configuration("Unknown database connection error".into()));
    error!(error = %error, "All database connection attempts failed");
    Err(AppError::Database(error.to_string()))
}

/// Verifies the database connection with a trivial query.
pub async fn verify_connection(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::query_as::<_, (i32,)>("SELECT 1 as result")
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            error!(error = %e, "Database connection verification failed");
            AppError::Database(e.to_string())
        })?;

    info!("Database connection verified");
    Ok(())
}
