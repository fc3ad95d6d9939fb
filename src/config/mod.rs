pub mod schema;

pub use schema::{default_config_path, ClientBridgeConfig, Config, ServerBridgeConfig};
