//! Azure Resource Manager gateway for virtual machine scale sets.
//!
//! Talks to the REST API directly:
//!
//! ```text
//! GET   .../virtualMachineScaleSets/{name}                      snapshot
//! PATCH .../virtualMachineScaleSets/{name}                      capacity
//! GET   .../virtualMachineScaleSets/{name}/virtualMachines      listing ($filter, nextLink)
//! PUT   .../virtualMachineScaleSets/{name}/virtualMachines/{id} protection
//! ```
//!
//! Updates return a long-running operation. Its handle records the
//! `Azure-AsyncOperation` (or `Location`) URL, which `await_operation`
//! polls until a terminal state.

pub mod credential;
pub mod models;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use scaleflip_core::{
    AppliedResult, AzureConfig, OperationTarget, PendingOperation, ProtectionPolicy, ScaleSetRef,
    ScaleSetSnapshot,
};

use crate::error::{ProviderError, ProviderResult};
use crate::gateway::{InstanceStream, ProviderGateway};

pub use credential::{AzureCliCredential, TokenSource};
use models::{
    AsyncOperationStatus, NamedResource, PollState, ProtectionUpdate, ScaleSetUpdate, ScaleSetVm,
    VirtualMachineScaleSet, VmListPage, api_error,
};

const ASYNC_OPERATION: &str = "azure-asyncoperation";

/// Shortest wait between two polls of the same operation.
const MIN_POLL_WAIT: Duration = Duration::from_secs(1);

/// How an operation reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum PollKind {
    /// Status body with a `status` field.
    AsyncOperation,
    /// `202` while running, `200`/`204` once done.
    Location,
}

/// Serialized into [`PendingOperation::token`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OperationHandle {
    resource_url: String,
    poll_url: Option<String>,
    kind: PollKind,
}

impl OperationHandle {
    fn from_headers(resource_url: String, headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        match (header(ASYNC_OPERATION), header(LOCATION.as_str())) {
            (Some(url), _) => Self {
                resource_url,
                poll_url: Some(url),
                kind: PollKind::AsyncOperation,
            },
            (None, Some(url)) => Self {
                resource_url,
                poll_url: Some(url),
                kind: PollKind::Location,
            },
            (None, None) => Self {
                resource_url,
                poll_url: None,
                kind: PollKind::AsyncOperation,
            },
        }
    }

    fn encode(&self) -> ProviderResult<String> {
        serde_json::to_string(self).map_err(|e| ProviderError::Decode(format!("operation handle: {e}")))
    }

    fn decode(token: &str) -> ProviderResult<Self> {
        serde_json::from_str(token)
            .map_err(|e| ProviderError::Decode(format!("operation handle {token}: {e}")))
    }
}

/// Parse a `Retry-After` header given in seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Wait before the next poll: `Retry-After` if present, else `fallback`,
/// never below [`MIN_POLL_WAIT`].
fn poll_wait(headers: &HeaderMap, fallback: Duration) -> Duration {
    retry_after(headers).unwrap_or(fallback).max(MIN_POLL_WAIT)
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// [`ProviderGateway`] over the Azure Resource Manager REST API.
pub struct AzureGateway<T = AzureCliCredential> {
    http: reqwest::Client,
    credential: T,
    endpoint: String,
    api_version: String,
    poll_interval: Duration,
}

impl AzureGateway<AzureCliCredential> {
    /// Gateway authenticated through the local Azure CLI login.
    pub fn from_config(config: &AzureConfig) -> ProviderResult<Self> {
        Self::new(config, AzureCliCredential::new(&config.endpoint))
    }
}

impl<T: TokenSource> AzureGateway<T> {
    pub fn new(config: &AzureConfig, credential: T) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            credential,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        })
    }

    fn scale_set_url(&self, set: &ScaleSetRef) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}",
            self.endpoint, set.subscription_id, set.resource_group, set.name
        )
    }

    fn instance_url(&self, set: &ScaleSetRef, instance_id: &str) -> String {
        format!("{}/virtualMachines/{instance_id}", self.scale_set_url(set))
    }

    fn versioned(&self, req: RequestBuilder) -> RequestBuilder {
        req.query(&[("api-version", self.api_version.as_str())])
    }

    /// Authenticate, send, and turn non-2xx responses into errors.
    async fn send(&self, req: RequestBuilder) -> ProviderResult<Response> {
        let token = self.credential.token().await?;
        let resp = req.bearer_auth(token).send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    async fn submit(
        &self,
        target: OperationTarget,
        resource_url: String,
        req: RequestBuilder,
    ) -> ProviderResult<PendingOperation> {
        let resp = self.send(req).await?;
        let handle = OperationHandle::from_headers(resource_url, resp.headers());
        debug!(operation = %target, status = resp.status().as_u16(), polling = handle.poll_url.is_some(), "update accepted");
        Ok(PendingOperation::new(target, handle.encode()?))
    }

    /// Poll until the operation is terminal. Returns the failure, if any.
    async fn poll(&self, target: &OperationTarget, handle: &OperationHandle) -> ProviderResult<()> {
        let Some(poll_url) = handle.poll_url.as_deref() else {
            return Ok(());
        };

        loop {
            let resp = self.send(self.http.get(poll_url)).await?;
            let wait = poll_wait(resp.headers(), self.poll_interval);

            match handle.kind {
                PollKind::AsyncOperation => {
                    let status: AsyncOperationStatus = resp.json().await?;
                    match status.state() {
                        PollState::Succeeded => return Ok(()),
                        PollState::Failed { status, message } => {
                            return Err(ProviderError::OperationFailed {
                                target: target.to_string(),
                                status,
                                message,
                            });
                        }
                        PollState::Running => {}
                    }
                }
                PollKind::Location => {
                    if resp.status() != StatusCode::ACCEPTED {
                        return Ok(());
                    }
                }
            }

            debug!(operation = %target, wait_secs = wait.as_secs(), "operation still running");
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl<T: TokenSource> ProviderGateway for AzureGateway<T> {
    async fn get_snapshot(&self, set: &ScaleSetRef) -> ProviderResult<ScaleSetSnapshot> {
        let req = self.versioned(self.http.get(self.scale_set_url(set)));
        let vmss: VirtualMachineScaleSet = self.send(req).await?.json().await?;
        vmss.into_snapshot()
    }

    async fn update_capacity(
        &self,
        set: &ScaleSetRef,
        snapshot: &ScaleSetSnapshot,
        capacity: u64,
    ) -> ProviderResult<PendingOperation> {
        let url = self.scale_set_url(set);
        let body = ScaleSetUpdate::capacity(&snapshot.sku, capacity);
        let req = self.versioned(self.http.patch(&url)).json(&body);
        let target = OperationTarget::Capacity {
            scale_set: snapshot.name.clone(),
            capacity,
        };
        self.submit(target, url, req).await
    }

    fn list_instances<'a>(&'a self, set: &'a ScaleSetRef, filter: &'a str) -> InstanceStream<'a> {
        let pages = stream::try_unfold(Cursor::Start, move |cursor| async move {
            let req = match cursor {
                Cursor::Done => return Ok::<_, ProviderError>(None),
                Cursor::Start => {
                    let url = format!("{}/virtualMachines", self.scale_set_url(set));
                    let req = self.versioned(self.http.get(url));
                    if filter.is_empty() {
                        req
                    } else {
                        req.query(&[("$filter", filter)])
                    }
                }
                Cursor::Next(link) => self.http.get(link),
            };

            let page: VmListPage = self.send(req).await?.json().await?;
            let next = page.next_link.map_or(Cursor::Done, Cursor::Next);
            let records: Vec<_> = page.value.into_iter().map(ScaleSetVm::into_record).collect();
            Ok(Some((records, next)))
        });

        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    async fn set_instance_protection(
        &self,
        set: &ScaleSetRef,
        instance_id: &str,
        policy: ProtectionPolicy,
    ) -> ProviderResult<PendingOperation> {
        let url = self.instance_url(set, instance_id);
        let req = self
            .versioned(self.http.put(&url))
            .json(&ProtectionUpdate::new(policy));
        let target = OperationTarget::Instance {
            instance_id: instance_id.to_string(),
        };
        self.submit(target, url, req).await
    }

    async fn await_operation(&self, op: PendingOperation) -> ProviderResult<AppliedResult> {
        let handle = OperationHandle::decode(&op.token)?;
        self.poll(&op.target, &handle).await?;

        let req = self.versioned(self.http.get(&handle.resource_url));
        let resource: NamedResource = self.send(req).await?.json().await?;
        info!(operation = %op.target, resource = %resource.name, "operation succeeded");
        Ok(AppliedResult {
            resource_name: resource.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    struct StaticToken;

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn token(&self) -> ProviderResult<String> {
            Ok("token".to_string())
        }
    }

    fn gateway() -> AzureGateway<StaticToken> {
        let config = AzureConfig {
            endpoint: "https://management.example.com/".to_string(),
            ..AzureConfig::default()
        };
        AzureGateway::new(&config, StaticToken).unwrap()
    }

    #[test]
    fn builds_resource_urls() {
        let gw = gateway();
        let set = ScaleSetRef::new("sub-1", "rg-web", "web-vmss");
        assert_eq!(
            gw.scale_set_url(&set),
            "https://management.example.com/subscriptions/sub-1/resourceGroups/rg-web/providers/Microsoft.Compute/virtualMachineScaleSets/web-vmss"
        );
        assert!(gw.instance_url(&set, "7").ends_with("/web-vmss/virtualMachines/7"));
    }

    #[test]
    fn handle_prefers_async_operation_header() {
        let mut headers = HeaderMap::new();
        headers.insert(ASYNC_OPERATION, HeaderValue::from_static("https://poll/async"));
        headers.insert(LOCATION, HeaderValue::from_static("https://poll/location"));

        let handle = OperationHandle::from_headers("https://res".to_string(), &headers);
        assert_eq!(handle.poll_url.as_deref(), Some("https://poll/async"));
        assert_eq!(handle.kind, PollKind::AsyncOperation);
    }

    #[test]
    fn handle_falls_back_to_location() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("https://poll/location"));

        let handle = OperationHandle::from_headers("https://res".to_string(), &headers);
        assert_eq!(handle.kind, PollKind::Location);
    }

    #[test]
    fn handle_without_headers_is_already_terminal() {
        let handle = OperationHandle::from_headers("https://res".to_string(), &HeaderMap::new());
        assert!(handle.poll_url.is_none());

        let token = handle.encode().unwrap();
        assert_eq!(OperationHandle::decode(&token).unwrap(), handle);
    }

    #[test]
    fn decode_rejects_foreign_tokens() {
        assert!(matches!(
            OperationHandle::decode("op-1"),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("15"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(15)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn poll_wait_never_drops_below_floor() {
        let fallback = Duration::from_secs(10);
        let mut headers = HeaderMap::new();
        assert_eq!(poll_wait(&headers, fallback), fallback);
        assert_eq!(poll_wait(&headers, Duration::ZERO), MIN_POLL_WAIT);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("0"));
        assert_eq!(poll_wait(&headers, fallback), MIN_POLL_WAIT);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(poll_wait(&headers, fallback), Duration::from_secs(30));
    }
}
