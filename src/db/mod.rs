pub mod connection;
pub mod repositories;

pub use connection::{create_pool, verify_connection};
