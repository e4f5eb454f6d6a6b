//! Shared types used across scaleflip crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies the scale set a rotation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleSetRef {
    pub subscription_id: String,
    pub resource_group: String,
    pub name: String,
}

impl ScaleSetRef {
    pub fn new(subscription_id: &str, resource_group: &str, name: &str) -> Self {
        Self {
            subscription_id: subscription_id.to_string(),
            resource_group: resource_group.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ScaleSetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subscription_id, self.resource_group, self.name)
    }
}

/// Symbolic SKU of a scale set. Echoed back unchanged on capacity updates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sku {
    pub name: Option<String>,
    pub tier: Option<String>,
}

/// The provider's current view of a scale set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSetSnapshot {
    pub name: String,
    pub sku: Sku,
    pub capacity: u64,
}

/// A single scale-set member as returned by an instance listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub name: Option<String>,
    pub latest_model_applied: bool,
}

/// Per-instance protection flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionPolicy {
    pub protect_from_scale_in: bool,
    pub protect_from_scale_set_actions: bool,
}

impl ProtectionPolicy {
    /// Protect from scale-in only.
    pub fn protected() -> Self {
        Self {
            protect_from_scale_in: true,
            protect_from_scale_set_actions: false,
        }
    }

    /// Clear both flags.
    pub fn unprotected() -> Self {
        Self {
            protect_from_scale_in: false,
            protect_from_scale_set_actions: false,
        }
    }
}

/// What a pending operation is mutating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationTarget {
    /// Capacity update on the scale set itself.
    Capacity { scale_set: String, capacity: u64 },
    /// Protection update on one member instance.
    Instance { instance_id: String },
}

impl fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationTarget::Capacity {
                scale_set,
                capacity,
            } => write!(f, "{scale_set} capacity={capacity}"),
            OperationTarget::Instance { instance_id } => write!(f, "instance {instance_id}"),
        }
    }
}

/// Handle to an in-flight provider update.
///
/// `token` is opaque to everything but the gateway that issued it: a polling
/// URL for Azure, an operation key for the in-memory provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub target: OperationTarget,
    pub token: String,
}

impl PendingOperation {
    pub fn new(target: OperationTarget, token: impl Into<String>) -> Self {
        Self {
            target,
            token: token.into(),
        }
    }
}

/// Terminal, successful outcome of an awaited operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedResult {
    /// Name of the resource the provider reports as modified.
    pub resource_name: String,
}

/// Compute `floor(capacity * factor)`.
///
/// The floor is intentional: with a shrink factor that is not the exact
/// inverse of the growth factor, odd capacities round down.
pub fn scale_capacity(capacity: u64, factor: f64) -> u64 {
    let scaled = (capacity as f64 * factor).floor();
    if scaled <= 0.0 || !scaled.is_finite() {
        0
    } else {
        scaled as u64
    }
}
