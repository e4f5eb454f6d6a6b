//! scaleflip.toml configuration parser.
//!
//! Every field is optional in the file; anything missing falls back to the
//! defaults of a plain double-then-halve rotation against public Azure.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Filter that selects instances running the latest scale-set model.
pub const LATEST_MODEL_FILTER: &str = "properties/latestModelApplied eq true";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid scale_out_factor {0}: must be a finite number greater than 1")]
    ScaleOutFactor(f64),

    #[error("invalid scale_in_factor {0}: must be a finite number between 0 and 1")]
    ScaleInFactor(f64),

    #[error("invalid azure.{field}: must be greater than zero")]
    ZeroInterval { field: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlipConfig {
    pub rotation: RotationConfig,
    pub azure: AzureConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub scale_out_factor: f64,
    pub scale_in_factor: f64,
    /// Listing filter selecting the batch created by the scale-out.
    pub new_instance_filter: String,
    /// Listing filter for the unprotect phase. Empty unprotects every member.
    pub unprotect_filter: String,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            scale_out_factor: 2.0,
            scale_in_factor: 0.5,
            new_instance_filter: LATEST_MODEL_FILTER.to_string(),
            unprotect_filter: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Resource Manager endpoint.
    pub endpoint: String,
    pub api_version: String,
    /// Poll interval for long-running operations without a `Retry-After`.
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://management.azure.com".to_string(),
            api_version: "2019-07-01".to_string(),
            poll_interval_secs: 10,
            request_timeout_secs: 60,
        }
    }
}

impl FlipConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: FlipConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check factor ranges and intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let out = self.rotation.scale_out_factor;
        if !out.is_finite() || out <= 1.0 {
            return Err(ConfigError::ScaleOutFactor(out));
        }

        let shrink = self.rotation.scale_in_factor;
        if !shrink.is_finite() || shrink <= 0.0 || shrink >= 1.0 {
            return Err(ConfigError::ScaleInFactor(shrink));
        }

        if self.azure.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "poll_interval_secs",
            });
        }
        if self.azure.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "request_timeout_secs",
            });
        }

        Ok(())
    }
}
