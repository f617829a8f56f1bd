pub mod command_relay;
pub mod config_delivery;
pub mod device_link_ws;
pub mod session_registry;
pub mod token_store;

// Re-export commonly used types
pub use command_relay::{CommandRelay, RelayOutcome};
pub use config_delivery::{ConfigDeliveryEngine, DeliveryOutcome};
pub use device_link_ws::DeviceLinkWs;
pub use session_registry::{DeviceSession, SessionRegistry};
pub use token_store::TokenStore;
