use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::config::settings::AuthConfig;
use crate::db::repositories::device_token_repository::{DeviceToken, DeviceTokenRepository};
use crate::db::repositories::format_timestamp;
use crate::error::AppError;

pub const TOKEN_KIND_PAIRING: &str = "pairing";
pub const TOKEN_KIND_PERSISTENT: &str = "persistent";

/// Issues and validates device credentials.
///
/// Pairing tokens bootstrap trust for an unidentified device and live for
/// minutes; persistent tokens are reused across reconnects and live for
/// weeks. Issuing never revokes earlier tokens, so several client instances
/// (or a re-flashed firmware) can stay authorized at once; stale ones just
/// expire.
#[derive(Clone)]
pub struct TokenStore {
    tokens: DeviceTokenRepository,
    config: AuthConfig,
}

impl TokenStore {
    pub fn new(tokens: DeviceTokenRepository, config: AuthConfig) -> Self {
        Self { tokens, config }
    }

    pub fn pairing_ttl_secs(&self) -> i64 {
        self.config.pairing_token_ttl_secs
    }

    pub async fn issue_pairing_token(
        &self,
        device_id: &str,
    ) -> Result<(String, DateTime<Utc>), AppError> {
        let token = generate_token(48);
        let expires_at = Utc::now() + Duration::seconds(self.config.pairing_token_ttl_secs);

        self.tokens
            .insert(
                device_id,
                &token,
                TOKEN_KIND_PAIRING,
                Some(format_timestamp(expires_at)),
            )
            .await?;

        info!(
            device_id = %device_id,
            expires_at = %expires_at,
            "Pairing token issued"
        );

        Ok((token, expires_at))
    }

    pub async fn issue_persistent_token(&self, device_id: &str) -> Result<String, AppError> {
        let token = generate_token(48);
        let expires_at = Utc::now() + Duration::days(self.config.persistent_token_ttl_days);

        self.tokens
            .insert(
                device_id,
                &token,
                TOKEN_KIND_PERSISTENT,
                Some(format_timestamp(expires_at)),
            )
            .await?;

        info!(device_id = %device_id, "Persistent token issued");

        Ok(token)
    }

    /// True iff a stored row matches exactly and is unexpired. Updates
    /// `last_used` on success. A miss is a normal negative result.
    pub async fn validate(&self, device_id: &str, token: &str) -> Result<bool, AppError> {
        match self.tokens.find_valid(device_id, token).await? {
            Some(row) => {
                self.tokens.touch_last_used(row.id).await?;
                debug!(
                    device_id = %device_id,
                    token_type = %row.token_type,
                    "Device token validated"
                );
                Ok(true)
            }
            None => {
                debug!(device_id = %device_id, "Device token rejected");
                Ok(false)
            }
        }
    }

    pub async fn active_token(&self, device_id: &str) -> Result<Option<DeviceToken>, AppError> {
        self.tokens.active_token(device_id).await
    }

    pub async fn revoke(&self, device_id: &str, token: &str) -> Result<bool, AppError> {
        self.tokens.revoke(device_id, token).await
    }
}

/// Random alphanumeric credential of the given length.
pub(crate) fn generate_token(len: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();

    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_pool;
    use pretty_assertions::assert_eq;

    fn store(pool: sqlx::SqlitePool) -> TokenStore {
        TokenStore::new(DeviceTokenRepository::new(pool), AuthConfig::default())
    }

    #[test]
    fn generated_tokens_are_alphanumeric_and_unique() {
        let a = generate_token(48);
        let b = generate_token(48);
        assert_eq!(a.len(), 48);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn pairing_token_round_trip() {
        let pool = memory_pool().await;
        let store = store(pool);

        let (token, expires_at) = store.issue_pairing_token("esp32_1").await.unwrap();
        assert!(expires_at > Utc::now());

        assert!(store.validate("esp32_1", &token).await.unwrap());
        // Wrong device, wrong token: both plain negative results.
        assert!(!store.validate("esp32_2", &token).await.unwrap());
        assert!(!store.validate("esp32_1", "bogus").await.unwrap());
    }

    #[tokio::test]
    async fn expired_pairing_token_is_rejected_even_if_never_used() {
        let pool = memory_pool().await;
        let store = store(pool.clone());

        let (token, _) = store.issue_pairing_token("esp32_1").await.unwrap();

        // Force the TTL window to elapse.
        sqlx::query("UPDATE device_tokens SET expires_at = ?")
            .bind(format_timestamp(Utc::now() - Duration::seconds(1)))
            .execute(&pool)
            .await
            .unwrap();

        assert!(!store.validate("esp32_1", &token).await.unwrap());
    }

    #[tokio::test]
    async fn persistent_tokens_accumulate_without_revocation() {
        let pool = memory_pool().await;
        let store = store(pool);

        let first = store.issue_persistent_token("esp32_1").await.unwrap();
        let second = store.issue_persistent_token("esp32_1").await.unwrap();

        // Rotation keeps the old token valid; both client instances work.
        assert!(store.validate("esp32_1", &first).await.unwrap());
        assert!(store.validate("esp32_1", &second).await.unwrap());
    }

    #[tokio::test]
    async fn validate_updates_last_used() {
        let pool = memory_pool().await;
        let store = store(pool.clone());

        let (token, _) = store.issue_pairing_token("esp32_1").await.unwrap();
        store.validate("esp32_1", &token).await.unwrap();

        let (last_used,): (Option<String>,) =
            sqlx::query_as("SELECT last_used FROM device_tokens WHERE token = ?")
                .bind(&token)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(last_used.is_some());
    }

    #[tokio::test]
    async fn revoke_deletes_the_row() {
        let pool = memory_pool().await;
        let store = store(pool);

        let token = store.issue_persistent_token("esp32_1").await.unwrap();
        assert!(store.revoke("esp32_1", &token).await.unwrap());
        assert!(!store.validate("esp32_1", &token).await.unwrap());
    }
}
