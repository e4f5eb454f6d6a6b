pub mod config;
pub mod types;

pub use config::{AzureConfig, ConfigError, FlipConfig, RotationConfig};
pub use types::*;
