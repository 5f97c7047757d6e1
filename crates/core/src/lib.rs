pub mod config;
pub mod error;

pub use config::{AmqpConfig, Config, LogsConfig};
pub use error::ConfigError;
