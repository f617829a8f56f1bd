use actix::prelude::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AppError;

/// Text frame destined for a live connection. The WebSocket actor delivers
/// it; tests register plain actors that just collect what arrives.
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct OutboundMessage(pub String);

/// Live connection metadata for an identified device. Lives exactly as long
/// as the connection owns its registry slot.
#[derive(Clone)]
pub struct DeviceSession {
    pub device_id: String,
    pub connection_id: Uuid,
    pub recipient: Recipient<OutboundMessage>,
    pub firmware_version: Option<String>,
    pub capabilities: Option<JsonValue>,
    pub last_seen_at: DateTime<Utc>,
}

/// Single source of truth for "is this device currently reachable".
///
/// At most one session per device id: registration is last-writer-wins, and
/// a new handshake simply evicts the prior entry. The evicted connection is
/// not closed, it just stops being addressable.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, DeviceSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self, session: DeviceSession) {
        let device_id = session.device_id.clone();
        let replaced = self.sessions.insert(device_id.clone(), session);

        if let Some(old) = replaced {
            info!(
                device_id = %device_id,
                old_connection_id = %old.connection_id,
                "Device session replaced by newer connection"
            );
        } else {
            info!(device_id = %device_id, "Device session registered");
        }

        debug!(session_count = self.sessions.len(), "Session registry updated");
    }

    pub fn lookup(&self, device_id: &str) -> Option<DeviceSession> {
        self.sessions.get(device_id).map(|entry| entry.value().clone())
    }

    /// Removes the entry only if the stored session still belongs to the
    /// calling connection. A disconnect racing behind a re-handshake must
    /// not evict the newer session.
    pub fn unregister(&self, device_id: &str, connection_id: &Uuid) -> bool {
        let removed = self
            .sessions
            .remove_if(device_id, |_, session| session.connection_id == *connection_id);

        if removed.is_some() {
            info!(device_id = %device_id, "Device session unregistered");
            true
        } else {
            debug!(
                device_id = %device_id,
                "Stale unregister ignored; slot owned by a newer connection"
            );
            false
        }
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    pub fn touch(&self, device_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(device_id) {
            entry.last_seen_at = Utc::now();
        }
    }

    pub fn online_device_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Non-blocking write to the device's connection, assessed synchronously.
    /// The underlying mailbox send is the only failure signal a delivery
    /// attempt gets.
    pub fn send(&self, device_id: &str, text: String) -> Result<(), AppError> {
        let session = self
            .lookup(device_id)
            .ok_or_else(|| AppError::DeviceOffline(format!("No live session for {}", device_id)))?;

        session
            .recipient
            .try_send(OutboundMessage(text))
            .map_err(|e| AppError::Delivery(format!("Connection write failed: {}", e)))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
