pub mod rotate;
pub mod unprotect;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tracing::{debug, info};

use scaleflip_core::{FlipConfig, ScaleSetRef};
use scaleflip_provider::AzureGateway;

/// The scale set a command operates on.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Azure subscription ID
    #[arg(long)]
    pub subscription_id: String,
    /// Resource group of the scale set
    #[arg(long)]
    pub resource_group: String,
    /// Name of the VM scale set
    #[arg(long)]
    pub vm_scale_set: String,
    /// Path to a scaleflip.toml
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl TargetArgs {
    pub fn scale_set(&self) -> ScaleSetRef {
        ScaleSetRef::new(&self.subscription_id, &self.resource_group, &self.vm_scale_set)
    }

    /// Load the config file if one was given, apply flag overrides, and
    /// validate the result.
    pub fn load_config(
        &self,
        scale_out_factor: Option<f64>,
        scale_in_factor: Option<f64>,
    ) -> anyhow::Result<FlipConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let config = FlipConfig::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?;
                info!(path = %path.display(), "loaded config");
                config
            }
            None => FlipConfig::default(),
        };

        if let Some(factor) = scale_out_factor {
            config.rotation.scale_out_factor = factor;
        }
        if let Some(factor) = scale_in_factor {
            config.rotation.scale_in_factor = factor;
        }
        config.validate()?;
        debug!(
            scale_out = config.rotation.scale_out_factor,
            scale_in = config.rotation.scale_in_factor,
            endpoint = %config.azure.endpoint,
            "effective configuration"
        );
        Ok(config)
    }
}

pub fn azure_gateway(config: &FlipConfig) -> anyhow::Result<Arc<AzureGateway>> {
    debug!(api_version = %config.azure.api_version, "building Resource Manager client");
    let gateway = AzureGateway::from_config(&config.azure)
        .context("failed to build Azure Resource Manager client")?;
    Ok(Arc::new(gateway))
}
