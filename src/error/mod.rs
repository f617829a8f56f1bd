use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Database(String),
    Internal(String),
    /// Bad or expired credentials (security key or device token).
    /// Recoverable by re-issuing; never reveals whether the subject exists.
    Auth(String),
    /// Ownership mismatch; terminal for the request only.
    NotAuthorized(String),
    /// No live session for the target device. Commands are rejected with
    /// this; configuration delivery never surfaces it (it queues instead).
    DeviceOffline(String),
    /// Write error on a connection the registry believed was online.
    Delivery(String),
    NotFound(String),
    BadRequest(String),
    Configuration(String),
    Serialization(String),
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    code: u16,
    message: String,
    error_type: String,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(e) => write!(f, "Database error: {}", e),
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::Auth(e) => write!(f, "Authentication error: {}", e),
            AppError::NotAuthorized(e) => write!(f, "Not authorized: {}", e),
            AppError::DeviceOffline(e) => write!(f, "Device offline: {}", e),
            AppError::Delivery(e) => write!(f, "Delivery failure: {}", e),
            AppError::NotFound(e) => write!(f, "Not found: {}", e),
            AppError::BadRequest(e) => write!(f, "Bad request: {}", e),
            AppError::Configuration(e) => write!(f, "Configuration error: {}", e),
            AppError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl StdError for AppError {}

impl AppError {
    /// Stable machine-readable tag, shared by HTTP responses and WebSocket
    /// error frames.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::Internal(_) => "internal_error",
            AppError::Auth(_) => "authentication_error",
            AppError::NotAuthorized(_) => "not_authorized",
            AppError::DeviceOffline(_) => "device_offline",
            AppError::Delivery(_) => "delivery_failure",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Configuration(_) => "configuration_error",
            AppError::Serialization(_) => "serialization_error",
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: self.to_string(),
            error_type: self.error_type().to_string(),
        };

        HttpResponse::build(status_code).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            AppError::DeviceOffline(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Delivery(_) => StatusCode::BAD_GATEWAY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => AppError::NotFound("Record not found".to_string()),
            _ => AppError::Database(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Serialization(error.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
