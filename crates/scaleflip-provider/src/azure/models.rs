//! Resource Manager wire types for scale sets and their VMs.

use serde::{Deserialize, Serialize};

use scaleflip_core::{InstanceRecord, ProtectionPolicy, ScaleSetSnapshot, Sku};

use crate::error::{ProviderError, ProviderResult};

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMachineScaleSet {
    pub name: String,
    pub sku: Option<WireSku>,
}

impl VirtualMachineScaleSet {
    pub fn into_snapshot(self) -> ProviderResult<ScaleSetSnapshot> {
        let sku = self
            .sku
            .ok_or_else(|| ProviderError::Decode(format!("scale set {} has no sku", self.name)))?;
        let capacity = match sku.capacity {
            Some(c) if c >= 0 => c as u64,
            Some(c) => {
                return Err(ProviderError::Decode(format!(
                    "scale set {} reports negative capacity {c}",
                    self.name
                )));
            }
            None => {
                return Err(ProviderError::Decode(format!(
                    "scale set {} has no capacity",
                    self.name
                )));
            }
        };
        Ok(ScaleSetSnapshot {
            name: self.name,
            sku: Sku {
                name: sku.name,
                tier: sku.tier,
            },
            capacity,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSku {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    pub capacity: Option<i64>,
}

/// PATCH body for a capacity change.
#[derive(Debug, Serialize)]
pub struct ScaleSetUpdate {
    pub sku: WireSku,
}

impl ScaleSetUpdate {
    pub fn capacity(sku: &Sku, capacity: u64) -> Self {
        Self {
            sku: WireSku {
                name: sku.name.clone(),
                tier: sku.tier.clone(),
                capacity: Some(i64::try_from(capacity).unwrap_or(i64::MAX)),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VmListPage {
    #[serde(default)]
    pub value: Vec<ScaleSetVm>,
    #[serde(rename = "nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScaleSetVm {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub name: Option<String>,
    pub properties: Option<ScaleSetVmProperties>,
}

impl ScaleSetVm {
    pub fn into_record(self) -> InstanceRecord {
        let latest_model_applied = self
            .properties
            .and_then(|p| p.latest_model_applied)
            .unwrap_or(false);
        InstanceRecord {
            instance_id: self.instance_id,
            name: self.name,
            latest_model_applied,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetVmProperties {
    pub latest_model_applied: Option<bool>,
    pub protection_policy: Option<WireProtectionPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireProtectionPolicy {
    pub protect_from_scale_in: bool,
    pub protect_from_scale_set_actions: bool,
}

impl From<ProtectionPolicy> for WireProtectionPolicy {
    fn from(p: ProtectionPolicy) -> Self {
        Self {
            protect_from_scale_in: p.protect_from_scale_in,
            protect_from_scale_set_actions: p.protect_from_scale_set_actions,
        }
    }
}

/// PUT body for a per-instance protection change.
#[derive(Debug, Serialize)]
pub struct ProtectionUpdate {
    pub properties: ProtectionUpdateProperties,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionUpdateProperties {
    pub protection_policy: WireProtectionPolicy,
}

impl ProtectionUpdate {
    pub fn new(policy: ProtectionPolicy) -> Self {
        Self {
            properties: ProtectionUpdateProperties {
                protection_policy: policy.into(),
            },
        }
    }
}

/// Body of an `Azure-AsyncOperation` status poll.
#[derive(Debug, Deserialize)]
pub struct AsyncOperationStatus {
    pub status: String,
    pub error: Option<CloudErrorBody>,
}

/// Terminal state of a polled operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Running,
    Succeeded,
    Failed { status: String, message: String },
}

impl AsyncOperationStatus {
    pub fn state(&self) -> PollState {
        if self.status.eq_ignore_ascii_case("succeeded") {
            PollState::Succeeded
        } else if self.status.eq_ignore_ascii_case("failed")
            || self.status.eq_ignore_ascii_case("canceled")
        {
            PollState::Failed {
                status: self.status.clone(),
                message: self
                    .error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_default(),
            }
        } else {
            PollState::Running
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CloudError {
    pub error: CloudErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Any resource; only the name is read back after an update.
#[derive(Debug, Deserialize)]
pub struct NamedResource {
    pub name: String,
}

/// Turn a non-2xx response body into a [`ProviderError::Api`].
pub fn api_error(status: u16, body: &str) -> ProviderError {
    match serde_json::from_str::<CloudError>(body) {
        Ok(cloud) => ProviderError::Api {
            status,
            code: cloud.error.code,
            message: cloud.error.message,
        },
        Err(_) => ProviderError::Api {
            status,
            code: "Unknown".to_string(),
            message: body.trim().to_string(),
        },
    }
}
