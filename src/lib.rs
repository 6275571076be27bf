pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http_client;
pub mod logging;
pub mod providers;
pub mod routing;
pub mod server;
pub mod stats;

pub use config::Settings;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
