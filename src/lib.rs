pub mod api;
pub mod board;
pub mod config;
pub mod error;
pub mod security;
pub mod sms;
pub mod store;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
