use chrono::{Duration, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::settings::DeliveryConfig;
use crate::db::repositories::config_history_repository::ConfigHistoryRepository;
use crate::db::repositories::config_queue_repository::{ConfigQueueEntry, ConfigQueueRepository};
use crate::db::repositories::config_snapshot_repository::ConfigSnapshotRepository;
use crate::db::repositories::format_timestamp;
use crate::error::AppError;
use crate::services::session_registry::SessionRegistry;
use crate::services::token_store::TokenStore;

/// How many pending entries a single worker tick will look at.
const RETRY_BATCH_SIZE: i64 = 100;

pub const HISTORY_SENT: &str = "sent";
pub const HISTORY_QUEUED: &str = "queued";
pub const HISTORY_APPLIED: &str = "applied";
pub const HISTORY_FAILED: &str = "failed";

/// What `deliver` tells its caller. Never a hard error: a device that cannot
/// be reached right now is a queued obligation, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub sent: bool,
    pub queued: bool,
    pub request_id: String,
}

/// Decides online-direct-send vs durable-queue for configuration updates,
/// and owns the retry worker that drains the queue.
///
/// Delivery is at-least-once: the handshake flush and the worker can both
/// try the same entry, so finalization goes through conditional updates in
/// the queue repository and the device de-duplicates by `meta.requestId`.
#[derive(Clone)]
pub struct ConfigDeliveryEngine {
    registry: SessionRegistry,
    queue: ConfigQueueRepository,
    snapshots: ConfigSnapshotRepository,
    history: ConfigHistoryRepository,
    tokens: TokenStore,
    config: DeliveryConfig,
}

impl ConfigDeliveryEngine {
    pub fn new(
        registry: SessionRegistry,
        queue: ConfigQueueRepository,
        snapshots: ConfigSnapshotRepository,
        history: ConfigHistoryRepository,
        tokens: TokenStore,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            snapshots,
            history,
            tokens,
            config,
        }
    }

    /// Deliver a configuration to a device: directly if it is online, via
    /// the durable queue otherwise. Write errors on a live connection fall
    /// through to queuing; the caller only ever sees `{sent, queued}`.
    pub async fn deliver(
        &self,
        device_id: &str,
        config: JsonValue,
        acting_user: Option<i64>,
    ) -> Result<DeliveryOutcome, AppError> {
        let mut payload = json!({ "config": config });
        let request_id = ensure_meta(&mut payload);

        if self.registry.is_online(device_id) {
            match self.try_direct_send(device_id, &payload).await {
                Ok(()) => {
                    self.snapshots.save(device_id, &request_id, &payload).await?;
                    self.history
                        .append(device_id, acting_user, HISTORY_SENT, Some(&payload), None)
                        .await?;

                    info!(
                        device_id = %device_id,
                        request_id = %request_id,
                        "Configuration sent directly"
                    );

                    return Ok(DeliveryOutcome {
                        sent: true,
                        queued: false,
                        request_id,
                    });
                }
                Err(e) => {
                    // Transient fault on a connection we believed was live;
                    // absorb it into the queue and let the worker retry.
                    warn!(
                        device_id = %device_id,
                        error = %e,
                        "Direct send failed, falling back to queue"
                    );
                    self.enqueue(device_id, &payload, acting_user, Some(&e.to_string()))
                        .await?;
                    return Ok(DeliveryOutcome {
                        sent: false,
                        queued: true,
                        request_id,
                    });
                }
            }
        }

        self.enqueue(device_id, &payload, acting_user, None).await?;
        Ok(DeliveryOutcome {
            sent: false,
            queued: true,
            request_id,
        })
    }

    async fn enqueue(
        &self,
        device_id: &str,
        payload: &JsonValue,
        acting_user: Option<i64>,
        error: Option<&str>,
    ) -> Result<i64, AppError> {
        let id = self
            .queue
            .enqueue(device_id, payload, self.config.max_retries)
            .await?;
        self.history
            .append(device_id, acting_user, HISTORY_QUEUED, Some(payload), error)
            .await?;

        info!(
            device_id = %device_id,
            queue_entry_id = id,
            "Configuration queued for offline delivery"
        );

        Ok(id)
    }

    /// Deliver every pending entry for a device that just identified.
    /// Returns the number of entries this call finalized.
    pub async fn flush_pending(&self, device_id: &str) -> Result<usize, AppError> {
        let entries = self.queue.pending_for_device(device_id).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        info!(
            device_id = %device_id,
            entry_count = entries.len(),
            "Flushing queued configuration to freshly identified device"
        );

        let mut delivered = 0;
        for entry in entries {
            // An exhausted entry belongs to the retry worker, which will
            // mark it failed on its next tick.
            if entry.retries >= entry.max_retries {
                continue;
            }
            if self.attempt_entry(&entry).await? {
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// One attempt at a pending queue entry. Returns true when this caller
    /// won the pending→sent transition.
    async fn attempt_entry(&self, entry: &ConfigQueueEntry) -> Result<bool, AppError> {
        let payload = entry.payload_json()?;
        let request_id = meta_request_id(&payload);

        match self.try_direct_send(&entry.device_id, &payload).await {
            Ok(()) => {
                if self.queue.mark_sent(entry.id).await? {
                    self.snapshots
                        .save(&entry.device_id, &request_id, &payload)
                        .await?;
                    self.history
                        .append(&entry.device_id, None, HISTORY_SENT, Some(&payload), None)
                        .await?;
                    Ok(true)
                } else {
                    // Another path finalized this entry first; the device
                    // saw a duplicate, which it de-duplicates by requestId.
                    debug!(
                        queue_entry_id = entry.id,
                        device_id = %entry.device_id,
                        "Queue entry already finalized elsewhere"
                    );
                    Ok(false)
                }
            }
            Err(e) => {
                debug!(
                    queue_entry_id = entry.id,
                    device_id = %entry.device_id,
                    error = %e,
                    "Queue delivery attempt failed"
                );
                self.queue.record_attempt(entry.id).await?;
                Ok(false)
            }
        }
    }

    /// One pass of the retry worker: exhausted entries become terminal
    /// failures, reachable devices get a delivery attempt, and aged-out
    /// failed entries are purged.
    pub async fn run_retry_tick(&self) -> Result<(), AppError> {
        let entries = self.queue.pending(RETRY_BATCH_SIZE).await?;

        for entry in entries {
            if entry.retries >= entry.max_retries {
                if self.queue.mark_failed(entry.id).await? {
                    let payload = entry.payload_json().ok();
                    self.history
                        .append(
                            &entry.device_id,
                            None,
                            HISTORY_FAILED,
                            payload.as_ref(),
                            Some("retry limit exceeded"),
                        )
                        .await?;
                    warn!(
                        queue_entry_id = entry.id,
                        device_id = %entry.device_id,
                        retries = entry.retries,
                        "Queue entry exhausted its retries"
                    );
                }
                continue;
            }

            // Offline is not an attempt; the entry just waits for the next
            // tick or for the handshake flush.
            if !self.registry.is_online(&entry.device_id) {
                continue;
            }

            self.attempt_entry(&entry).await?;
        }

        let cutoff = format_timestamp(Utc::now() - Duration::hours(self.config.retention_hours));
        let purged = self.queue.purge_failed_before(&cutoff).await?;
        if purged > 0 {
            info!(purged, "Purged failed queue entries past retention");
        }

        Ok(())
    }

    /// Spawn the periodic retry worker. Ticks share the queue store with
    /// the handshake flush; the conditional updates keep them from racing.
    pub fn start_retry_worker(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let interval = std::time::Duration::from_secs(engine.config.retry_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = engine.run_retry_tick().await {
                    warn!(error = %e, "Retry worker tick failed");
                }
            }
        })
    }

    /// Device acknowledged an `update_config` by request id. Marks the
    /// stored snapshot applied; pending queue entries are a separate track
    /// and are not dequeued here (the device applies idempotently).
    pub async fn handle_applied_ack(
        &self,
        device_id: &str,
        request_id: &str,
        ok: bool,
        details: Option<&str>,
    ) -> Result<bool, AppError> {
        if ok {
            let matched = self.snapshots.mark_applied(device_id, request_id).await?;
            if matched {
                info!(
                    device_id = %device_id,
                    request_id = %request_id,
                    "Configuration applied by device"
                );
            } else {
                warn!(
                    device_id = %device_id,
                    request_id = %request_id,
                    "Ack for unknown request id ignored"
                );
            }
            self.history
                .append(device_id, None, HISTORY_APPLIED, None, None)
                .await?;
            Ok(matched)
        } else {
            warn!(
                device_id = %device_id,
                request_id = %request_id,
                details = ?details,
                "Device reported configuration apply failure"
            );
            self.history
                .append(device_id, None, HISTORY_FAILED, None, details)
                .await?;
            Ok(false)
        }
    }

    /// Non-blocking write of the `update_config` frame, assessed
    /// synchronously. The mailbox error is the only failure signal.
    async fn try_direct_send(&self, device_id: &str, payload: &JsonValue) -> Result<(), AppError> {
        let token = self
            .tokens
            .active_token(device_id)
            .await?
            .map(|t| t.token);

        let message = json!({
            "type": "update_config",
            "deviceId": device_id,
            "token": token,
            "config": payload.get("config").cloned().unwrap_or(JsonValue::Null),
            "meta": payload.get("meta").cloned().unwrap_or(JsonValue::Null),
        });

        self.registry.send(device_id, message.to_string())
    }
}

/// Attach `meta.requestId` and `meta.timestamp` if absent and return the
/// request id. The request id is the device-side idempotency key.
fn ensure_meta(payload: &mut JsonValue) -> String {
    let fresh_id = Uuid::new_v4().to_string();

    let Some(envelope) = payload.as_object_mut() else {
        return fresh_id;
    };

    let meta = envelope.entry("meta").or_insert_with(|| json!({}));
    if !meta.is_object() {
        *meta = json!({});
    }
    let Some(meta) = meta.as_object_mut() else {
        return fresh_id;
    };

    if !meta.get("requestId").map(|v| v.is_string()).unwrap_or(false) {
        meta.insert("requestId".to_string(), json!(fresh_id.clone()));
    }
    if !meta.contains_key("timestamp") {
        meta.insert("timestamp".to_string(), json!(format_timestamp(Utc::now())));
    }

    meta.get("requestId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or(fresh_id)
}

fn meta_request_id(payload: &JsonValue) -> String {
    payload
        .pointer("/meta/requestId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::AuthConfig;
    use crate::db::repositories::device_token_repository::DeviceTokenRepository;
    use crate::db::test_support::memory_pool;
    use crate::services::session_registry::tests::session_for;
    use pretty_assertions::assert_eq;
    use sqlx::SqlitePool;

    fn engine(pool: SqlitePool, registry: SessionRegistry) -> ConfigDeliveryEngine {
        ConfigDeliveryEngine::new(
            registry,
            ConfigQueueRepository::new(pool.clone()),
            ConfigSnapshotRepository::new(pool.clone()),
            ConfigHistoryRepository::new(pool.clone()),
            TokenStore::new(DeviceTokenRepository::new(pool), AuthConfig::default()),
            DeliveryConfig::default(),
        )
    }

    fn wifi_config() -> JsonValue {
        json!({ "wifi_ssid": "X" })
    }

    #[test]
    fn ensure_meta_attaches_request_id_and_timestamp_once() {
        let mut payload = json!({ "config": { "wifi_ssid": "X" } });
        let first = ensure_meta(&mut payload);
        assert_eq!(payload.pointer("/meta/requestId").unwrap(), &json!(first));
        assert!(payload.pointer("/meta/timestamp").is_some());

        // Idempotent: a payload that already carries meta keeps it.
        let second = ensure_meta(&mut payload);
        assert_eq!(first, second);
    }

    #[actix_rt::test]
    async fn deliver_offline_queues_pending_entry() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let engine = engine(pool.clone(), registry);

        let outcome = engine
            .deliver("esp32_1", wifi_config(), Some(1))
            .await
            .unwrap();
        assert!(!outcome.sent);
        assert!(outcome.queued);

        let queue = ConfigQueueRepository::new(pool.clone());
        let pending = queue.pending_for_device("esp32_1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, "pending");
        assert_eq!(pending[0].retries, 0);

        let history = ConfigHistoryRepository::new(pool);
        let rows = history.list_for_device("esp32_1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, HISTORY_QUEUED);
    }

    #[actix_rt::test]
    async fn deliver_online_sends_directly_and_snapshots() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let (session, received) = session_for("esp32_1");
        registry.register(session);

        let engine = engine(pool.clone(), registry);
        let outcome = engine
            .deliver("esp32_1", wifi_config(), Some(1))
            .await
            .unwrap();
        assert!(outcome.sent);
        assert!(!outcome.queued);

        actix_rt::task::yield_now().await;
        let frames = received.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        let frame: JsonValue = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "update_config");
        assert_eq!(frame["deviceId"], "esp32_1");
        assert_eq!(frame["config"]["wifi_ssid"], "X");
        assert_eq!(
            frame.pointer("/meta/requestId").unwrap().as_str().unwrap(),
            outcome.request_id
        );

        let snapshots = ConfigSnapshotRepository::new(pool);
        let latest = snapshots.latest_for_device("esp32_1").await.unwrap().unwrap();
        assert_eq!(latest.request_id, outcome.request_id);
        assert!(!latest.applied);
    }

    #[actix_rt::test]
    async fn worker_tick_delivers_once_device_comes_online() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let engine = engine(pool.clone(), registry.clone());

        let outcome = engine.deliver("esp32_1", wifi_config(), None).await.unwrap();
        assert!(outcome.queued);

        // Offline tick: no attempt, no retry counted.
        engine.run_retry_tick().await.unwrap();
        let queue = ConfigQueueRepository::new(pool.clone());
        let pending = queue.pending_for_device("esp32_1").await.unwrap();
        assert_eq!(pending[0].retries, 0);

        let (session, received) = session_for("esp32_1");
        registry.register(session);

        engine.run_retry_tick().await.unwrap();
        actix_rt::task::yield_now().await;

        assert!(queue.pending_for_device("esp32_1").await.unwrap().is_empty());
        let entry = queue.get(pending[0].id).await.unwrap().unwrap();
        assert_eq!(entry.status, "sent");
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[actix_rt::test]
    async fn exhausted_entry_becomes_terminal_failed() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let engine = engine(pool.clone(), registry.clone());

        engine.deliver("esp32_1", wifi_config(), None).await.unwrap();

        let queue = ConfigQueueRepository::new(pool.clone());
        let entry_id = queue.pending_for_device("esp32_1").await.unwrap()[0].id;

        sqlx::query("UPDATE config_queue SET retries = max_retries WHERE id = ?")
            .bind(entry_id)
            .execute(&pool)
            .await
            .unwrap();

        engine.run_retry_tick().await.unwrap();
        let entry = queue.get(entry_id).await.unwrap().unwrap();
        assert_eq!(entry.status, "failed");

        // Terminal: even with the device online no further attempt happens.
        let (session, received) = session_for("esp32_1");
        registry.register(session);
        engine.run_retry_tick().await.unwrap();
        actix_rt::task::yield_now().await;
        assert!(received.lock().unwrap().is_empty());

        let history = ConfigHistoryRepository::new(pool);
        let rows = history.list_for_device("esp32_1", 10).await.unwrap();
        assert!(rows.iter().any(|r| r.action == HISTORY_FAILED));
    }

    #[actix_rt::test]
    async fn handshake_flush_delivers_without_waiting_for_the_timer() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let engine = engine(pool.clone(), registry.clone());

        let outcome = engine.deliver("esp32_1", wifi_config(), None).await.unwrap();
        assert!(outcome.queued);

        let (session, received) = session_for("esp32_1");
        registry.register(session);

        let delivered = engine.flush_pending("esp32_1").await.unwrap();
        assert_eq!(delivered, 1);

        // Second flush finds nothing left.
        assert_eq!(engine.flush_pending("esp32_1").await.unwrap(), 0);

        actix_rt::task::yield_now().await;
        assert_eq!(received.lock().unwrap().len(), 1);

        // Ack with the matching request id flips the snapshot.
        let frame: JsonValue =
            serde_json::from_str(&received.lock().unwrap()[0]).unwrap();
        let request_id = frame.pointer("/meta/requestId").unwrap().as_str().unwrap();
        assert!(engine
            .handle_applied_ack("esp32_1", request_id, true, None)
            .await
            .unwrap());

        let snapshots = ConfigSnapshotRepository::new(pool);
        let latest = snapshots.latest_for_device("esp32_1").await.unwrap().unwrap();
        assert!(latest.applied);
    }

    #[actix_rt::test]
    async fn ack_for_unknown_request_id_is_ignored() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let engine = engine(pool, registry);

        let matched = engine
            .handle_applied_ack("esp32_1", "no-such-request", true, None)
            .await
            .unwrap();
        assert!(!matched);
    }

    #[actix_rt::test]
    async fn failed_attempt_increments_retry_count() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let engine = engine(pool.clone(), registry.clone());

        engine.deliver("esp32_1", wifi_config(), None).await.unwrap();

        let queue = ConfigQueueRepository::new(pool);
        let entry = queue.pending_for_device("esp32_1").await.unwrap()[0].clone();

        // This is what attempt_entry does when the write to a supposedly
        // live connection bounces.
        assert!(queue.record_attempt(entry.id).await.unwrap());
        let after = queue.get(entry.id).await.unwrap().unwrap();
        assert_eq!(after.retries, entry.retries + 1);
        assert_eq!(after.status, "pending");
    }

    #[actix_rt::test]
    async fn handshake_flush_skips_exhausted_entries() {
        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let engine = engine(pool.clone(), registry.clone());

        engine.deliver("esp32_1", wifi_config(), None).await.unwrap();

        let queue = ConfigQueueRepository::new(pool.clone());
        let entry_id = queue.pending_for_device("esp32_1").await.unwrap()[0].id;
        sqlx::query("UPDATE config_queue SET retries = max_retries WHERE id = ?")
            .bind(entry_id)
            .execute(&pool)
            .await
            .unwrap();

        let (session, received) = session_for("esp32_1");
        registry.register(session);

        // The entry is out of budget; it waits for the worker to fail it
        // instead of getting one more send.
        assert_eq!(engine.flush_pending("esp32_1").await.unwrap(), 0);
        actix_rt::task::yield_now().await;
        assert!(received.lock().unwrap().is_empty());

        let entry = queue.get(entry_id).await.unwrap().unwrap();
        assert_eq!(entry.status, "pending");
        assert_eq!(entry.retries, entry.max_retries);
    }
}
