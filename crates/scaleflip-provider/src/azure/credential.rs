//! Bearer tokens for Resource Manager, resolved through the Azure CLI.
//!
//! The CLI is invoked once and the token cached until shortly before it
//! expires, so a rotation touching hundreds of instances does not spawn
//! hundreds of `az` processes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};

/// Refresh a cached token this long before it expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// Assumed lifetime when the CLI does not report an expiry.
const FALLBACK_LIFETIME: Duration = Duration::from_secs(600);

/// Source of bearer tokens for Resource Manager requests.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn token(&self) -> ProviderResult<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedToken {
    value: String,
    expires_at: u64,
}

impl CachedToken {
    fn is_fresh(&self, now: u64) -> bool {
        now + REFRESH_MARGIN.as_secs() < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct CliToken {
    #[serde(rename = "accessToken")]
    access_token: String,
    expires_on: Option<u64>,
}

fn parse_cli_token(stdout: &[u8], now: u64) -> ProviderResult<CachedToken> {
    let token: CliToken = serde_json::from_slice(stdout)
        .map_err(|e| ProviderError::Credential(format!("unreadable az output: {e}")))?;
    if token.access_token.is_empty() {
        return Err(ProviderError::Credential("az returned an empty token".to_string()));
    }
    Ok(CachedToken {
        value: token.access_token,
        expires_at: token
            .expires_on
            .unwrap_or(now + FALLBACK_LIFETIME.as_secs()),
    })
}

/// Token source backed by `az account get-access-token`.
#[derive(Debug)]
pub struct AzureCliCredential {
    resource: String,
    cached: Mutex<Option<CachedToken>>,
}

impl AzureCliCredential {
    /// `resource` is the audience, normally the Resource Manager endpoint.
    pub fn new(resource: &str) -> Self {
        let mut resource = resource.to_string();
        if !resource.ends_with('/') {
            resource.push('/');
        }
        Self {
            resource,
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> ProviderResult<CachedToken> {
        let output = Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                &self.resource,
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| ProviderError::Credential(format!("failed to run az: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Credential(format!(
                "az account get-access-token failed: {}",
                stderr.trim()
            )));
        }

        parse_cli_token(&output.stdout, epoch_secs())
    }
}

#[async_trait]
impl TokenSource for AzureCliCredential {
    async fn token(&self) -> ProviderResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(epoch_secs()) {
                return Ok(token.value.clone());
            }
        }

        let token = self.fetch().await?;
        debug!(expires_at = token.expires_at, "refreshed azure cli token");
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
