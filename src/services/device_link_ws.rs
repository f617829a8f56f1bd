use actix::prelude::*;
use actix_web_actors::{ws, ws::CloseCode, ws::CloseReason, ws::Message};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::repositories::device_repository::DeviceRepository;
use crate::services::command_relay::CommandRelay;
use crate::services::config_delivery::ConfigDeliveryEngine;
use crate::services::session_registry::{DeviceSession, OutboundMessage, SessionRegistry};
use crate::services::token_store::TokenStore;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Token bucket rate limiter for per-connection rate limiting
struct TokenBucket {
    tokens: u32,
    capacity: u32,
    refill_per_sec: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs();
        if elapsed > 0 {
            let add = (elapsed as u32) * self.refill_per_sec;
            self.tokens = self.tokens.saturating_add(add).min(self.capacity);
            self.last_refill = Instant::now();
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// An `identify` frame from a device. Unknown extra fields are tolerated.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentifyRequest {
    device_id: String,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    firmware_version: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    capabilities: Option<JsonValue>,
}

/// A `config_applied` acknowledgment from a device.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigAppliedAck {
    request_id: String,
    status: String,
    #[serde(default)]
    details: Option<String>,
}

/// A `secureCommand` frame from a user client.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecureCommandRequest {
    user_id: String,
    security_key: String,
    device_id: String,
    command: JsonValue,
}

/// WebSocket actor carrying one device or user-client connection.
///
/// A connection starts unauthenticated. A device sends `identify` to enter
/// the session registry; a user client never identifies and may only send
/// `secureCommand` and `ping`.
pub struct DeviceLinkWs {
    /// Unique identifier for this WebSocket connection
    pub connection_id: Uuid,
    /// Device ID, set once an identify succeeds
    pub device_id: Option<String>,
    /// Last heartbeat time
    pub last_heartbeat: Instant,
    registry: SessionRegistry,
    tokens: TokenStore,
    devices: DeviceRepository,
    delivery: ConfigDeliveryEngine,
    relay: CommandRelay,
    /// Per-connection rate limiter
    rate: TokenBucket,
}

impl DeviceLinkWs {
    pub fn new(
        registry: SessionRegistry,
        tokens: TokenStore,
        devices: DeviceRepository,
        delivery: ConfigDeliveryEngine,
        relay: CommandRelay,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            device_id: None,
            last_heartbeat: Instant::now(),
            registry,
            tokens,
            devices,
            delivery,
            relay,
            rate: TokenBucket::new(50, 25),
        }
    }

    /// Record a successful identify. A connection that previously
    /// identified as a different device gives up that registry slot;
    /// stopped() only unregisters the final identity.
    fn adopt_identity(&mut self, device_id: String) {
        if let Some(prev) = self.device_id.take()
            && prev != device_id
        {
            self.registry.unregister(&prev, &self.connection_id);
        }
        self.device_id = Some(device_id);
    }

    /// Start heartbeat process for this connection
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    connection_id = %act.connection_id,
                    device_id = ?act.device_id,
                    "WebSocket client heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }

            ctx.ping(b"heartbeat");
        });
    }

    /// Send error message to client
    fn send_error(&self, code: &str, message: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let error_response = serde_json::json!({
            "type": "error",
            "code": code,
            "message": message,
            "timestamp": chrono::Utc::now()
        });

        ctx.text(error_response.to_string());
    }

    /// Parse and handle incoming message
    fn handle_message(&mut self, msg: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let parsed: JsonValue = match serde_json::from_str(msg) {
            Ok(json) => json,
            Err(_) => {
                warn!(
                    connection_id = %self.connection_id,
                    "Failed to parse WebSocket message"
                );
                self.send_error("invalid_json", "Invalid JSON format", ctx);
                return;
            }
        };

        let message_type = parsed
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        debug!(
            connection_id = %self.connection_id,
            message_type = %message_type,
            device_id = ?self.device_id,
            "Received WebSocket message"
        );

        let addr = ctx.address();

        match message_type {
            "identify" => {
                addr.do_send(HandleIdentifyMessage { payload: parsed });
            }
            "config_applied" => {
                addr.do_send(HandleConfigAppliedMessage { payload: parsed });
            }
            "secureCommand" => {
                addr.do_send(HandleSecureCommandMessage { payload: parsed });
            }
            "ping" => {
                debug!(
                    connection_id = %self.connection_id,
                    log_stage = "ws:client_ping",
                    "Received ping message from client"
                );
                let pong = serde_json::json!({ "type": "pong" });
                ctx.text(pong.to_string());
            }
            "pong" => {
                debug!(
                    connection_id = %self.connection_id,
                    log_stage = "ws:client_pong",
                    "Received pong message from client"
                );
            }
            _ => {
                warn!(
                    connection_id = %self.connection_id,
                    message_type = %message_type,
                    "Unknown message type received"
                );
                self.send_error(
                    "unknown_message_type",
                    &format!("Unknown message type: {}", message_type),
                    ctx,
                );
            }
        }
    }
}

impl Actor for DeviceLinkWs {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            connection_id = %self.connection_id,
            "WebSocket connection started"
        );
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(
            connection_id = %self.connection_id,
            device_id = ?self.device_id,
            "WebSocket connection stopped"
        );

        // Conditional: a newer connection for the same device keeps its
        // registry slot.
        if let Some(device_id) = &self.device_id {
            self.registry.unregister(device_id, &self.connection_id);
        }
    }
}

impl Handler<OutboundMessage> for DeviceLinkWs {
    type Result = ();

    fn handle(&mut self, msg: OutboundMessage, ctx: &mut Self::Context) {
        debug!(
            connection_id = %self.connection_id,
            device_id = ?self.device_id,
            log_stage = "link:send",
            "Delivering message to client"
        );
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<Message, ws::ProtocolError>> for DeviceLinkWs {
    fn handle(&mut self, msg: Result<Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
                if let Some(device_id) = &self.device_id {
                    self.registry.touch(device_id);
                }
            }
            Ok(Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                if let Some(device_id) = &self.device_id {
                    self.registry.touch(device_id);
                }

                if !self.rate.allow() {
                    warn!(
                        connection_id = %self.connection_id,
                        device_id = ?self.device_id,
                        "Rate limit exceeded; closing WebSocket"
                    );
                    ctx.close(Some(CloseReason {
                        code: CloseCode::Policy,
                        description: Some("rate limit exceeded".into()),
                    }));
                    ctx.stop();
                    return;
                }

                self.handle_message(&text, ctx);
            }
            Ok(Message::Binary(bin)) => {
                self.last_heartbeat = Instant::now();
                debug!(
                    connection_id = %self.connection_id,
                    len = bin.len(),
                    "Ignoring binary frame on device link"
                );
            }
            Ok(Message::Close(reason)) => {
                info!(
                    connection_id = %self.connection_id,
                    reason = ?reason,
                    "WebSocket close message received"
                );
                ctx.stop();
            }
            Err(e) => {
                error!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "WebSocket protocol error"
                );
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// Internal messages for handling message types asynchronously
#[derive(Message)]
#[rtype(result = "()")]
struct HandleIdentifyMessage {
    payload: JsonValue,
}

#[derive(Message)]
#[rtype(result = "()")]
struct HandleConfigAppliedMessage {
    payload: JsonValue,
}

#[derive(Message)]
#[rtype(result = "()")]
struct HandleSecureCommandMessage {
    payload: JsonValue,
}

/// Outcome of the async half of the handshake, fed back into actor state.
enum HandshakeResult {
    Identified { device_id: String },
    PairingRequired,
    Failed,
}

impl Handler<HandleIdentifyMessage> for DeviceLinkWs {
    type Result = ();

    fn handle(&mut self, msg: HandleIdentifyMessage, ctx: &mut Self::Context) -> Self::Result {
        let request: IdentifyRequest = match serde_json::from_value(msg.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    connection_id = %self.connection_id,
                    log_stage = "identify:early_return",
                    code = "invalid_identify",
                    error = %e,
                    "Identify failed: malformed frame"
                );
                self.send_error("invalid_identify", "Identify requires a deviceId", ctx);
                return;
            }
        };

        info!(
            connection_id = %self.connection_id,
            device_id = %request.device_id,
            has_token = request.token.is_some(),
            firmware_version = ?request.firmware_version,
            log_stage = "identify:begin",
            "Starting identity handshake"
        );

        let tokens = self.tokens.clone();
        let devices = self.devices.clone();
        let registry = self.registry.clone();
        let delivery = self.delivery.clone();
        let connection_id = self.connection_id;
        let recipient = ctx.address().recipient::<OutboundMessage>();

        ctx.spawn(
            async move {
                let valid = match &request.token {
                    Some(token) => match tokens.validate(&request.device_id, token).await {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(
                                connection_id = %connection_id,
                                device_id = %request.device_id,
                                error = %e,
                                "Token validation failed, treating as unauthenticated"
                            );
                            false
                        }
                    },
                    None => false,
                };

                if !valid {
                    // Unknown or stale device: hand out a pairing token and
                    // stay unauthenticated.
                    return match tokens.issue_pairing_token(&request.device_id).await {
                        Ok((pairing_token, _expires_at)) => {
                            info!(
                                connection_id = %connection_id,
                                device_id = %request.device_id,
                                log_stage = "identify:pairing_required",
                                "Issued pairing token to unidentified device"
                            );
                            let reply = serde_json::json!({
                                "type": "pairing_required",
                                "pairingToken": pairing_token,
                                "ttlSeconds": tokens.pairing_ttl_secs(),
                            });
                            recipient.do_send(OutboundMessage(reply.to_string()));
                            HandshakeResult::PairingRequired
                        }
                        Err(e) => {
                            error!(
                                connection_id = %connection_id,
                                device_id = %request.device_id,
                                error = %e,
                                "Failed to issue pairing token"
                            );
                            let reply = serde_json::json!({
                                "type": "error",
                                "code": "pairing_failed",
                                "message": "Could not issue pairing token",
                                "timestamp": chrono::Utc::now()
                            });
                            recipient.do_send(OutboundMessage(reply.to_string()));
                            HandshakeResult::Failed
                        }
                    };
                }

                // Keep the device row fresh; ownership is assigned over HTTP.
                let device_name = request
                    .device_name
                    .clone()
                    .unwrap_or_else(|| request.device_id.clone());
                if let Err(e) = devices
                    .upsert_device(&request.device_id, &device_name, None)
                    .await
                {
                    warn!(
                        device_id = %request.device_id,
                        error = %e,
                        "Failed to upsert device record during handshake"
                    );
                }

                // Rotation: a fresh persistent token every handshake, prior
                // ones stay valid until they expire.
                let persistent_token = match tokens.issue_persistent_token(&request.device_id).await
                {
                    Ok(t) => t,
                    Err(e) => {
                        error!(
                            connection_id = %connection_id,
                            device_id = %request.device_id,
                            error = %e,
                            "Failed to issue persistent token"
                        );
                        let reply = serde_json::json!({
                            "type": "error",
                            "code": "token_issue_failed",
                            "message": "Could not issue persistent token",
                            "timestamp": chrono::Utc::now()
                        });
                        recipient.do_send(OutboundMessage(reply.to_string()));
                        return HandshakeResult::Failed;
                    }
                };

                registry.register(DeviceSession {
                    device_id: request.device_id.clone(),
                    connection_id,
                    recipient: recipient.clone(),
                    firmware_version: request.firmware_version.clone(),
                    capabilities: request.capabilities.clone(),
                    last_seen_at: chrono::Utc::now(),
                });

                info!(
                    connection_id = %connection_id,
                    device_id = %request.device_id,
                    log_stage = "identify:success",
                    "Device identified and registered"
                );

                let reply = serde_json::json!({
                    "type": "identify_success",
                    "persistentToken": persistent_token,
                });
                recipient.do_send(OutboundMessage(reply.to_string()));

                // Drain anything durably queued while the device was away.
                match delivery.flush_pending(&request.device_id).await {
                    Ok(0) => {}
                    Ok(count) => {
                        info!(
                            device_id = %request.device_id,
                            delivered = count,
                            "Flushed queued configuration after handshake"
                        );
                    }
                    Err(e) => {
                        warn!(
                            device_id = %request.device_id,
                            error = %e,
                            "Failed to flush queued configuration after handshake"
                        );
                    }
                }

                HandshakeResult::Identified {
                    device_id: request.device_id,
                }
            }
            .into_actor(self)
            .map(|result, act, _ctx| {
                if let HandshakeResult::Identified { device_id } = result {
                    act.adopt_identity(device_id);
                }
            }),
        );
    }
}

impl Handler<HandleConfigAppliedMessage> for DeviceLinkWs {
    type Result = ();

    fn handle(&mut self, msg: HandleConfigAppliedMessage, ctx: &mut Self::Context) -> Self::Result {
        let device_id = match &self.device_id {
            Some(id) => id.clone(),
            None => {
                self.send_error("not_identified", "Identify before acknowledging", ctx);
                return;
            }
        };

        let ack: ConfigAppliedAck = match serde_json::from_value(msg.payload) {
            Ok(a) => a,
            Err(_) => {
                self.send_error("invalid_ack", "config_applied requires a requestId", ctx);
                return;
            }
        };

        let delivery = self.delivery.clone();
        ctx.spawn(
            async move {
                let ok = ack.status == "ok";
                if let Err(e) = delivery
                    .handle_applied_ack(&device_id, &ack.request_id, ok, ack.details.as_deref())
                    .await
                {
                    warn!(
                        device_id = %device_id,
                        request_id = %ack.request_id,
                        error = %e,
                        "Failed to record config_applied ack"
                    );
                }
            }
            .into_actor(self),
        );
    }
}

impl Handler<HandleSecureCommandMessage> for DeviceLinkWs {
    type Result = ();

    fn handle(&mut self, msg: HandleSecureCommandMessage, ctx: &mut Self::Context) -> Self::Result {
        let request: SecureCommandRequest = match serde_json::from_value(msg.payload) {
            Ok(r) => r,
            Err(_) => {
                self.send_error(
                    "invalid_command",
                    "secureCommand requires userId, securityKey, deviceId and command",
                    ctx,
                );
                return;
            }
        };

        let relay = self.relay.clone();
        let connection_id = self.connection_id;
        let recipient = ctx.address().recipient::<OutboundMessage>();

        ctx.spawn(
            async move {
                // Fire-and-forget toward the device; only gate failures come
                // back to the caller.
                if let Err(e) = relay
                    .relay(
                        &request.user_id,
                        &request.security_key,
                        &request.device_id,
                        &request.command,
                    )
                    .await
                {
                    debug!(
                        connection_id = %connection_id,
                        device_id = %request.device_id,
                        error = %e,
                        "Command relay rejected"
                    );
                    let reply = serde_json::json!({
                        "type": "error",
                        "code": e.error_type(),
                        "message": e.to_string(),
                        "timestamp": chrono::Utc::now()
                    });
                    recipient.do_send(OutboundMessage(reply.to_string()));
                }
            }
            .into_actor(self),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn identify_frame_parses_with_and_without_token() {
        let with_token: IdentifyRequest = serde_json::from_value(json!({
            "type": "identify",
            "deviceId": "esp32_1",
            "firmwareVersion": "2.1.0",
            "token": "abc",
            "capabilities": {"relays": 4}
        }))
        .unwrap();
        assert_eq!(with_token.device_id, "esp32_1");
        assert_eq!(with_token.token.as_deref(), Some("abc"));
        assert_eq!(with_token.firmware_version.as_deref(), Some("2.1.0"));

        let bare: IdentifyRequest = serde_json::from_value(json!({
            "type": "identify",
            "deviceId": "esp32_2"
        }))
        .unwrap();
        assert!(bare.token.is_none());
        assert!(bare.capabilities.is_none());
    }

    #[test]
    fn identify_without_device_id_is_rejected() {
        let missing = serde_json::from_value::<IdentifyRequest>(json!({
            "type": "identify",
            "firmwareVersion": "2.1.0"
        }));
        assert!(missing.is_err());
    }

    #[test]
    fn config_applied_frame_parses_status_and_details() {
        let ack: ConfigAppliedAck = serde_json::from_value(json!({
            "type": "config_applied",
            "deviceId": "esp32_1",
            "requestId": "req-1",
            "status": "error",
            "details": "flash write failed"
        }))
        .unwrap();
        assert_eq!(ack.request_id, "req-1");
        assert_eq!(ack.status, "error");
        assert_eq!(ack.details.as_deref(), Some("flash write failed"));
    }

    #[test]
    fn secure_command_frame_requires_all_credentials() {
        let ok: SecureCommandRequest = serde_json::from_value(json!({
            "type": "secureCommand",
            "userId": "alice",
            "securityKey": "k",
            "deviceId": "esp32_1",
            "command": "toggle"
        }))
        .unwrap();
        assert_eq!(ok.user_id, "alice");
        assert_eq!(ok.command, json!("toggle"));

        let missing_key = serde_json::from_value::<SecureCommandRequest>(json!({
            "type": "secureCommand",
            "userId": "alice",
            "deviceId": "esp32_1",
            "command": "toggle"
        }));
        assert!(missing_key.is_err());
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(2, 1);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());

        bucket.last_refill = Instant::now() - Duration::from_secs(2);
        assert!(bucket.allow());
    }

    #[actix_rt::test]
    async fn re_identify_releases_the_previous_registry_slot() {
        use crate::config::settings::{AuthConfig, DeliveryConfig};
        use crate::db::repositories::config_history_repository::ConfigHistoryRepository;
        use crate::db::repositories::config_queue_repository::ConfigQueueRepository;
        use crate::db::repositories::config_snapshot_repository::ConfigSnapshotRepository;
        use crate::db::repositories::device_token_repository::DeviceTokenRepository;
        use crate::db::repositories::security_key_repository::SecurityKeyRepository;
        use crate::db::repositories::user_repository::UserRepository;
        use crate::db::test_support::memory_pool;
        use crate::services::session_registry::tests::session_for;

        let pool = memory_pool().await;
        let registry = SessionRegistry::new();
        let tokens = TokenStore::new(
            DeviceTokenRepository::new(pool.clone()),
            AuthConfig::default(),
        );
        let devices = DeviceRepository::new(pool.clone());
        let delivery = ConfigDeliveryEngine::new(
            registry.clone(),
            ConfigQueueRepository::new(pool.clone()),
            ConfigSnapshotRepository::new(pool.clone()),
            ConfigHistoryRepository::new(pool.clone()),
            tokens.clone(),
            DeliveryConfig::default(),
        );
        let relay = CommandRelay::new(
            UserRepository::new(pool.clone()),
            devices.clone(),
            SecurityKeyRepository::new(pool),
            registry.clone(),
            AuthConfig::default(),
        );
        let mut link = DeviceLinkWs::new(registry.clone(), tokens, devices, delivery, relay);

        let (mut session_a, _) = session_for("device_a");
        session_a.connection_id = link.connection_id;
        registry.register(session_a);
        link.adopt_identity("device_a".to_string());

        // The same connection identifies again under a different id. The
        // old slot must not survive the switch.
        let (mut session_b, _) = session_for("device_b");
        session_b.connection_id = link.connection_id;
        registry.register(session_b);
        link.adopt_identity("device_b".to_string());

        assert!(!registry.is_online("device_a"));
        assert!(registry.is_online("device_b"));
        assert_eq!(link.device_id.as_deref(), Some("device_b"));

        // Re-identifying as the same device keeps the slot.
        link.adopt_identity("device_b".to_string());
        assert!(registry.is_online("device_b"));
    }
}
