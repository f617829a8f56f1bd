pub mod config_handlers;
pub mod device_handlers;
pub mod health;
pub mod link_handlers;
pub mod security_key_handlers;
