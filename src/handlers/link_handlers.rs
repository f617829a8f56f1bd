use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tracing::info;

use crate::db::repositories::device_repository::DeviceRepository;
use crate::services::command_relay::CommandRelay;
use crate::services::config_delivery::ConfigDeliveryEngine;
use crate::services::device_link_ws::DeviceLinkWs;
use crate::services::session_registry::SessionRegistry;
use crate::services::token_store::TokenStore;

/// WebSocket endpoint shared by devices and user clients. The connection
/// starts unauthenticated; devices identify over the socket itself.
pub async fn device_link_ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    registry: web::Data<SessionRegistry>,
    tokens: web::Data<TokenStore>,
    devices: web::Data<DeviceRepository>,
    delivery: web::Data<ConfigDeliveryEngine>,
    relay: web::Data<CommandRelay>,
) -> Result<HttpResponse, actix_web::Error> {
    info!(
        peer = ?req.peer_addr(),
        "Starting device link WebSocket connection"
    );

    let ws_actor = DeviceLinkWs::new(
        registry.get_ref().clone(),
        tokens.get_ref().clone(),
        devices.get_ref().clone(),
        delivery.get_ref().clone(),
        relay.get_ref().clone(),
    );

    let resp = ws::start(ws_actor, &req, stream)?;
    Ok(resp)
}
