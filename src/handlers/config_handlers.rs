use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::db::repositories::config_history_repository::ConfigHistoryRepository;
use crate::error::AppError;
use crate::services::config_delivery::ConfigDeliveryEngine;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverConfigRequest {
    pub config: JsonValue,
    /// Acting user for the audit trail; optional for system-initiated pushes.
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverConfigResponse {
    pub sent: bool,
    pub queued: bool,
    pub request_id: String,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// Push a configuration to a device: delivered now if it is online, queued
/// durably otherwise. Always 200; `sent`/`queued` tell the caller which.
pub async fn deliver_config_handler(
    delivery: web::Data<ConfigDeliveryEngine>,
    path: web::Path<String>,
    req_body: web::Json<DeliverConfigRequest>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    let request = req_body.into_inner();

    if !request.config.is_object() {
        return Err(AppError::BadRequest(
            "config must be a JSON object".to_string(),
        ));
    }

    let outcome = delivery
        .deliver(&device_id, request.config, request.user_id)
        .await?;

    info!(
        device_id = %device_id,
        sent = outcome.sent,
        queued = outcome.queued,
        request_id = %outcome.request_id,
        "Configuration delivery requested over HTTP"
    );

    Ok(HttpResponse::Ok().json(DeliverConfigResponse {
        sent: outcome.sent,
        queued: outcome.queued,
        request_id: outcome.request_id,
    }))
}

/// Append-only audit trail of delivery attempts for a device.
pub async fn config_history_handler(
    history: web::Data<ConfigHistoryRepository>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    let entries = history.list_for_device(&device_id, limit).await?;

    Ok(HttpResponse::Ok().json(entries))
}
