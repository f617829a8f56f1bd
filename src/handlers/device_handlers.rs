use actix_web::{web, HttpResponse};
use serde::Serialize;

use crate::db::repositories::device_repository::DeviceRepository;
use crate::error::AppError;
use crate::services::session_registry::SessionRegistry;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusResponse {
    pub device_id: String,
    pub online: bool,
    pub last_seen_at: Option<String>,
    pub firmware_version: Option<String>,
}

/// Registry liveness for a single device, enriched from its stored record
/// when one exists.
pub async fn device_status_handler(
    registry: web::Data<SessionRegistry>,
    devices: web::Data<DeviceRepository>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();

    let session = registry.lookup(&device_id);
    let known = devices.get_by_device_id(&device_id).await?;

    if session.is_none() && known.is_none() {
        return Err(AppError::NotFound(format!(
            "Device {} is not known",
            device_id
        )));
    }

    let response = DeviceStatusResponse {
        online: session.is_some(),
        last_seen_at: session.as_ref().map(|s| s.last_seen_at.to_rfc3339()),
        firmware_version: session.and_then(|s| s.firmware_version),
        device_id,
    };

    Ok(HttpResponse::Ok().json(response))
}

/// All known devices with their current liveness.
pub async fn list_devices_handler(
    registry: web::Data<SessionRegistry>,
    devices: web::Data<DeviceRepository>,
) -> Result<HttpResponse, AppError> {
    let rows = devices.list_devices().await?;

    let response: Vec<_> = rows
        .into_iter()
        .map(|device| {
            let online = registry.is_online(&device.device_id);
            serde_json::json!({
                "device": device,
                "online": online,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(response))
}
