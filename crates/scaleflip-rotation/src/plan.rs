//! Rotation plan — how far to grow and shrink, and which instances to touch.

use serde::{Deserialize, Serialize};

use scaleflip_core::RotationConfig;

/// Parameters of a single rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationPlan {
    /// Capacity multiplier for the scale-out phase.
    pub scale_out_factor: f64,
    /// Capacity multiplier for the scale-in phase.
    pub scale_in_factor: f64,
    /// Listing filter selecting the freshly created batch.
    pub new_instance_filter: String,
    /// Listing filter for the unprotect phase. Empty means every member.
    pub unprotect_filter: String,
}

impl Default for RotationPlan {
    fn default() -> Self {
        Self::from(&RotationConfig::default())
    }
}

impl From<&RotationConfig> for RotationPlan {
    fn from(cfg: &RotationConfig) -> Self {
        Self {
            scale_out_factor: cfg.scale_out_factor,
            scale_in_factor: cfg.scale_in_factor,
            new_instance_filter: cfg.new_instance_filter.clone(),
            unprotect_filter: cfg.unprotect_filter.clone(),
        }
    }
}
