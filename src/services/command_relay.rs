use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::config::settings::AuthConfig;
use crate::db::repositories::device_repository::DeviceRepository;
use crate::db::repositories::format_timestamp;
use crate::db::repositories::security_key_repository::SecurityKeyRepository;
use crate::db::repositories::user_repository::{User, UserRepository};
use crate::error::AppError;
use crate::services::session_registry::SessionRegistry;
use crate::services::token_store::generate_token;

const SECURITY_KEY_LENGTH: usize = 64;

/// Above this many live debounce signatures, stale ones get swept on the
/// next relay.
const DEBOUNCE_SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Command was written to the live connection.
    Relayed,
    /// Duplicate within the debounce window; dropped silently.
    Debounced,
}

/// Authorizes user-originated commands and forwards them to live device
/// sessions. Commands are real-time only: an offline device is a hard
/// rejection, never a queue entry.
#[derive(Clone)]
pub struct CommandRelay {
    users: UserRepository,
    devices: DeviceRepository,
    keys: SecurityKeyRepository,
    registry: SessionRegistry,
    debounce: Arc<DashMap<(String, String), Instant>>,
    config: AuthConfig,
}

impl CommandRelay {
    pub fn new(
        users: UserRepository,
        devices: DeviceRepository,
        keys: SecurityKeyRepository,
        registry: SessionRegistry,
        config: AuthConfig,
    ) -> Self {
        Self {
            users,
            devices,
            keys,
            registry,
            debounce: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Gate order is fixed: authentication, ownership, debounce, liveness,
    /// write. The first failing gate decides the outcome.
    pub async fn relay(
        &self,
        user_name: &str,
        security_key: &str,
        device_id: &str,
        command: &JsonValue,
    ) -> Result<RelayOutcome, AppError> {
        let user = self.authenticate(user_name, security_key).await?;
        self.check_ownership(&user, device_id).await?;

        let raw = raw_command(command);

        if self.is_debounced(device_id, &raw) {
            debug!(
                device_id = %device_id,
                user = %user.username,
                "Duplicate command debounced"
            );
            return Ok(RelayOutcome::Debounced);
        }

        self.registry.send(device_id, raw)?;

        info!(
            device_id = %device_id,
            user = %user.username,
            "Command relayed"
        );

        Ok(RelayOutcome::Relayed)
    }

    /// Resolves the caller and checks the security key. The error is the
    /// same whether the user is unknown or the key is bad, so callers
    /// cannot probe for valid usernames.
    async fn authenticate(&self, user_name: &str, security_key: &str) -> Result<User, AppError> {
        let user = self.users.find_by_username(user_name).await?;

        let valid = match &user {
            Some(u) => self.keys.validate(u.id, security_key).await?,
            None => false,
        };

        match (user, valid) {
            (Some(u), true) => Ok(u),
            _ => {
                warn!(user = %user_name, "Command rejected: invalid security key");
                Err(AppError::Auth("Invalid security key".to_string()))
            }
        }
    }

    /// Admins bypass; an unowned device (no row or NULL owner) accepts any
    /// authenticated caller; otherwise the caller must be the owner.
    async fn check_ownership(&self, user: &User, device_id: &str) -> Result<(), AppError> {
        if user.is_admin() {
            return Ok(());
        }

        let owner_id = self
            .devices
            .get_by_device_id(device_id)
            .await?
            .and_then(|d| d.owner_id);

        match owner_id {
            Some(owner) if owner != user.id => {
                warn!(
                    device_id = %device_id,
                    user = %user.username,
                    "Command rejected: caller does not own device"
                );
                Err(AppError::NotAuthorized(format!(
                    "Not authorized to control device {}",
                    device_id
                )))
            }
            _ => Ok(()),
        }
    }

    /// One write per `(device_id, command)` signature per window. Returns
    /// true for the duplicate; the winner stamps the table.
    fn is_debounced(&self, device_id: &str, raw: &str) -> bool {
        let window = Duration::from_millis(self.config.command_debounce_ms);
        let now = Instant::now();
        let signature = (device_id.to_string(), raw.to_string());

        let mut duplicate = false;
        self.debounce
            .entry(signature)
            .and_modify(|last| {
                if now.duration_since(*last) < window {
                    duplicate = true;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);

        if !duplicate && self.debounce.len() > DEBOUNCE_SWEEP_THRESHOLD {
            self.debounce
                .retain(|_, last| now.duration_since(*last) < window);
        }

        duplicate
    }

    /// Mints a fresh security key for the user, invalidating every prior
    /// key. Returns the key and its expiry.
    pub async fn issue_key(&self, user_id: i64) -> Result<(String, String), AppError> {
        let key = generate_token(SECURITY_KEY_LENGTH);
        let expires_at =
            format_timestamp(Utc::now() + chrono::Duration::hours(self.config.security_key_ttl_hours));

        self.keys.replace_key(user_id, &key, &expires_at).await?;

        info!(user_id, expires_at = %expires_at, "Issued new security key");
        Ok((key, expires_at))
    }
}

/// A JSON string relays as its inner text; anything else relays as its
/// serialized form.
fn raw_command(command: &JsonValue) -> String {
    match command {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_pool;
    use crate::services::session_registry::tests::session_for;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sqlx::SqlitePool;

    async fn seeded_relay(pool: &SqlitePool, registry: SessionRegistry) -> CommandRelay {
        CommandRelay::new(
            UserRepository::new(pool.clone()),
            DeviceRepository::new(pool.clone()),
            SecurityKeyRepository::new(pool.clone()),
            registry,
            AuthConfig::default(),
        )
    }

    async fn create_user(pool: &SqlitePool, username: &str, role: &str) -> i64 {
        UserRepository::new(pool.clone())
            .create_user(username, "hash", role)
            .await
            .unwrap()
            .id
    }

    async fn key_for(relay: &CommandRelay, user_id: i64) -> String {
        relay.issue_key(user_id).await.unwrap().0
    }

    #[actix_rt::test]
    async fn unknown_user_and_bad_key_yield_the_same_error() {
        let pool = memory_pool().await;
        let relay = seeded_relay(&pool, SessionRegistry::new()).await;

        let alice = create_user(&pool, "alice", "user").await;
        key_for(&relay, alice).await;

        let unknown = relay
            .relay("nobody", "whatever", "esp32_1", &json!("toggle"))
            .await
            .unwrap_err();
        let bad_key = relay
            .relay("alice", "wrong-key", "esp32_1", &json!("toggle"))
            .await
            .unwrap_err();

        assert_eq!(unknown.to_string(), bad_key.to_string());
        assert!(matches!(unknown, AppError::Auth(_)));
    }

    #[actix_rt::test]
    async fn new_key_invalidates_the_previous_one() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let (session, _) = session_for("esp32_1");
        registry.register(session);

        let relay = seeded_relay(&pool, registry).await;
        let alice = create_user(&pool, "alice", "user").await;

        let old_key = key_for(&relay, alice).await;
        let new_key = key_for(&relay, alice).await;

        let with_old = relay
            .relay("alice", &old_key, "esp32_1", &json!("toggle"))
            .await;
        assert!(matches!(with_old, Err(AppError::Auth(_))));

        let with_new = relay
            .relay("alice", &new_key, "esp32_1", &json!("toggle"))
            .await
            .unwrap();
        assert_eq!(with_new, RelayOutcome::Relayed);
    }

    #[actix_rt::test]
    async fn ownership_matrix_gates_relay() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let (session, _) = session_for("owned");
        registry.register(session);
        let (session, _) = session_for("unowned");
        registry.register(session);

        let relay = seeded_relay(&pool, registry).await;
        let owner = create_user(&pool, "owner", "user").await;
        let other = create_user(&pool, "other", "user").await;
        let admin = create_user(&pool, "admin", "admin").await;

        let devices = DeviceRepository::new(pool.clone());
        devices
            .upsert_device("owned", "Owned Device", None)
            .await
            .unwrap();
        devices.set_owner("owned", Some(owner)).await.unwrap();
        devices
            .upsert_device("unowned", "Unowned Device", None)
            .await
            .unwrap();

        let owner_key = key_for(&relay, owner).await;
        let other_key = key_for(&relay, other).await;
        let admin_key = key_for(&relay, admin).await;

        // Owner commands their own device.
        assert_eq!(
            relay
                .relay("owner", &owner_key, "owned", &json!("a"))
                .await
                .unwrap(),
            RelayOutcome::Relayed
        );

        // A non-owner is rejected.
        let denied = relay
            .relay("other", &other_key, "owned", &json!("b"))
            .await
            .unwrap_err();
        assert!(matches!(denied, AppError::NotAuthorized(_)));

        // NULL owner admits any authenticated user.
        assert_eq!(
            relay
                .relay("other", &other_key, "unowned", &json!("c"))
                .await
                .unwrap(),
            RelayOutcome::Relayed
        );

        // Admin bypasses ownership.
        assert_eq!(
            relay
                .relay("admin", &admin_key, "owned", &json!("d"))
                .await
                .unwrap(),
            RelayOutcome::Relayed
        );
    }

    #[actix_rt::test]
    async fn duplicate_command_in_window_writes_exactly_once() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let (session, received) = session_for("esp32_1");
        registry.register(session);

        let relay = seeded_relay(&pool, registry).await;
        let alice = create_user(&pool, "alice", "user").await;
        let key = key_for(&relay, alice).await;

        let first = relay
            .relay("alice", &key, "esp32_1", &json!("toggle"))
            .await
            .unwrap();
        let second = relay
            .relay("alice", &key, "esp32_1", &json!("toggle"))
            .await
            .unwrap();

        assert_eq!(first, RelayOutcome::Relayed);
        assert_eq!(second, RelayOutcome::Debounced);

        // A different command is not suppressed.
        let third = relay
            .relay("alice", &key, "esp32_1", &json!("reboot"))
            .await
            .unwrap();
        assert_eq!(third, RelayOutcome::Relayed);

        actix_rt::task::yield_now().await;
        let frames = received.lock().unwrap().clone();
        assert_eq!(frames, vec!["toggle".to_string(), "reboot".to_string()]);
    }

    #[actix_rt::test]
    async fn offline_device_rejects_commands_outright() {
        let pool = memory_pool().await;
        let relay = seeded_relay(&pool, SessionRegistry::new()).await;
        let alice = create_user(&pool, "alice", "user").await;
        let key = key_for(&relay, alice).await;

        let err = relay
            .relay("alice", &key, "esp32_1", &json!("toggle"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DeviceOffline(_)));
    }

    #[test]
    fn structured_commands_relay_serialized() {
        assert_eq!(raw_command(&json!("toggle")), "toggle");
        assert_eq!(
            raw_command(&json!({"action": "set", "value": 1})),
            r#"{"action":"set","value":1}"#
        );
    }
}
