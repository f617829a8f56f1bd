//! ESP32 Home Server Library
//!
//! Connectivity and configuration delivery for small embedded devices:
//! WebSocket device links, pairing/persistent token handshake, durable
//! configuration queueing with retries, and authorized command relay.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod services;

// Re-export commonly used types for convenience
pub use config::AppSettings;
pub use error::{AppError, AppResult};
