use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSettings {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub environment: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

/// Credential lifetimes for device tokens and user security keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    pub pairing_token_ttl_secs: i64,
    pub persistent_token_ttl_days: i64,
    pub security_key_ttl_hours: i64,
    pub command_debounce_ms: u64,
}

/// Durable-queue worker tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub retry_interval_secs: u64,
    pub max_retries: i64,
    pub retention_hours: i64,
}

impl AppSettings {
    pub fn from_env() -> Result<Self, AppError> {
        let app_name = env::var("APP_NAME").unwrap_or_else(|_| "esp32home-server".to_string());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://data/esp32home.db?mode=rwc".to_string());

        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|_| {
                AppError::Configuration("SERVER_PORT must be a valid port number".to_string())
            })?;

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        let pairing_token_ttl_secs = parse_env_i64("PAIRING_TOKEN_TTL_SECS", 600)?;
        let persistent_token_ttl_days = parse_env_i64("PERSISTENT_TOKEN_TTL_DAYS", 30)?;
        let security_key_ttl_hours = parse_env_i64("SECURITY_KEY_TTL_HOURS", 2)?;
        let command_debounce_ms = parse_env_u64("COMMAND_DEBOUNCE_MS", 400)?;

        let retry_interval_secs = parse_env_u64("QUEUE_RETRY_INTERVAL_SECS", 30)?;
        let max_retries = parse_env_i64("QUEUE_MAX_RETRIES", 5)?;
        let retention_hours = parse_env_i64("QUEUE_RETENTION_HOURS", 24)?;

        Ok(Self {
            app: AppConfig {
                name: app_name,
                environment,
            },
            database: DatabaseConfig { url: database_url },
            server: ServerConfig {
                host: server_host,
                port: server_port,
                cors_origins,
            },
            auth: AuthConfig {
                pairing_token_ttl_secs,
                persistent_token_ttl_days,
                security_key_ttl_hours,
                command_debounce_ms,
            },
            delivery: DeliveryConfig {
                retry_interval_secs,
                max_retries,
                retention_hours,
            },
        })
    }
}

fn parse_env_i64(name: &str, default: i64) -> Result<i64, AppError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<i64>()
            .map_err(|_| AppError::Configuration(format!("{} must be a valid number", name))),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, AppError> {
    match env::var(name) {
        Ok(raw) => raw.parse::<u64>().map_err(|_| {
            AppError::Configuration(format!("{} must be a non-negative number", name))
        }),
        Err(_) => Ok(default),
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            pairing_token_ttl_secs: 600,
            persistent_token_ttl_days: 30,
            security_key_ttl_hours: 2,
            command_debounce_ms: 400,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 30,
            max_retries: 5,
            retention_hours: 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn negative_duration_value_is_rejected() {
        unsafe { env::set_var("TEST_DURATION_NEGATIVE", "-5") };
        let err = parse_env_u64("TEST_DURATION_NEGATIVE", 30).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
        unsafe { env::remove_var("TEST_DURATION_NEGATIVE") };
    }

    #[test]
    fn missing_and_valid_duration_values_parse() {
        assert_eq!(parse_env_u64("TEST_DURATION_MISSING", 400).unwrap(), 400);

        unsafe { env::set_var("TEST_DURATION_SET", "250") };
        assert_eq!(parse_env_u64("TEST_DURATION_SET", 400).unwrap(), 250);
        unsafe { env::remove_var("TEST_DURATION_SET") };
    }
}
