use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::repositories::user_repository::UserRepository;
use crate::error::AppError;
use crate::services::command_relay::CommandRelay;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueKeyRequest {
    pub user_id: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueKeyResponse {
    pub security_key: String,
    pub expires_at: String,
}

/// Mint a fresh security key for a user. All prior keys for that user stop
/// validating immediately (single active key).
pub async fn issue_security_key_handler(
    relay: web::Data<CommandRelay>,
    users: web::Data<UserRepository>,
    req_body: web::Json<IssueKeyRequest>,
) -> Result<HttpResponse, AppError> {
    let user_id = req_body.user_id;

    let user = users
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

    let (security_key, expires_at) = relay.issue_key(user.id).await?;

    info!(user_id = user.id, "Security key issued over HTTP");

    Ok(HttpResponse::Ok().json(IssueKeyResponse {
        security_key,
        expires_at,
    }))
}
