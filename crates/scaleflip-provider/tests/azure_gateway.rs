//! AzureGateway against a local stand-in for Resource Manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use scaleflip_core::config::LATEST_MODEL_FILTER;
use scaleflip_core::{AzureConfig, ProtectionPolicy, ScaleSetRef, ScaleSetSnapshot, Sku};
use scaleflip_provider::{AzureGateway, ProviderError, ProviderGateway, ProviderResult, TokenSource};

// ── MockArm ──────────────────────────────────────────────────────────

struct StubRequest {
    method: String,
    /// Path plus query string.
    target: String,
    /// Request line and headers, lowercased.
    head: String,
    body: String,
}

struct StubResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl StubResponse {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

type Handler = Arc<dyn Fn(&StubRequest, &str) -> StubResponse + Send + Sync>;

/// An HTTP/1.1 server answering every request through `handler`, which
/// also receives the server's base URL for building poll and page links.
/// One request per connection.
struct MockArm {
    base: String,
    requests: Arc<Mutex<Vec<StubRequest>>>,
}

impl MockArm {
    async fn start<F>(handler: F) -> Self
    where
        F: Fn(&StubRequest, &str) -> StubResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind to random port");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let handler: Handler = Arc::new(handler);
        let log = Arc::clone(&requests);
        let root = base.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                let log = Arc::clone(&log);
                let root = root.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, &handler, &log, &root).await;
                });
            }
        });

        Self { base, requests }
    }

    fn requests(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.method.clone(), r.target.clone()))
            .collect()
    }

    fn with_request<T>(&self, index: usize, f: impl FnOnce(&StubRequest) -> T) -> T {
        f(&self.requests.lock().unwrap()[index])
    }

    fn gateway(&self) -> AzureGateway<StaticToken> {
        let config = AzureConfig {
            endpoint: self.base.clone(),
            poll_interval_secs: 1,
            request_timeout_secs: 10,
            ..AzureConfig::default()
        };
        AzureGateway::new(&config, StaticToken).unwrap()
    }
}

async fn serve(
    mut stream: TcpStream,
    handler: &Handler,
    log: &Mutex<Vec<StubRequest>>,
    base: &str,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.split_whitespace();
    let request = StubRequest {
        method: request_line.next().unwrap_or_default().to_string(),
        target: request_line.next().unwrap_or_default().to_string(),
        head: head.to_ascii_lowercase(),
        body: String::from_utf8_lossy(&buf[head_end..]).to_string(),
    };
    let response = handler(&request, base);
    log.lock().unwrap().push(request);

    let mut out = format!(
        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.body.len()
    );
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(&response.body);
    stream.write_all(out.as_bytes()).await?;
    stream.shutdown().await
}

struct StaticToken;

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> ProviderResult<String> {
        Ok("test-token".to_string())
    }
}

fn scale_set() -> ScaleSetRef {
    ScaleSetRef::new("sub-1", "rg-web", "web")
}

fn snapshot() -> ScaleSetSnapshot {
    ScaleSetSnapshot {
        name: "web".to_string(),
        sku: Sku {
            name: Some("Standard_D2s_v3".to_string()),
            tier: Some("Standard".to_string()),
        },
        capacity: 4,
    }
}

fn not_found() -> StubResponse {
    StubResponse::json(404, json!({"error": {"code": "NotFound", "message": "no route"}}))
}

fn vm(id: &str, latest: bool) -> Value {
    json!({
        "instanceId": id,
        "name": format!("web_{id}"),
        "properties": {"latestModelApplied": latest}
    })
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_is_read_with_bearer_token_and_api_version() {
    let arm = MockArm::start(|req, _| match req.method.as_str() {
        "GET" if req.target.contains("/virtualMachineScaleSets/web?") => StubResponse::json(
            200,
            json!({
                "name": "web",
                "sku": {"name": "Standard_D2s_v3", "tier": "Standard", "capacity": 4}
            }),
        ),
        _ => not_found(),
    })
    .await;

    let snap = arm.gateway().get_snapshot(&scale_set()).await.unwrap();
    assert_eq!(snap, snapshot());

    arm.with_request(0, |req| {
        assert!(req.target.starts_with(
            "/subscriptions/sub-1/resourceGroups/rg-web/providers/Microsoft.Compute/virtualMachineScaleSets/web"
        ));
        assert!(req.target.contains("api-version=2019-07-01"));
        assert!(req.head.contains("authorization: bearer test-token"));
    });
}

#[tokio::test]
async fn error_status_maps_cloud_error_body() {
    let arm = MockArm::start(|req, _| match req.method.as_str() {
        "PUT" => StubResponse::json(
            409,
            json!({"error": {"code": "OperationNotAllowed", "message": "instance is being deleted"}}),
        ),
        _ => not_found(),
    })
    .await;

    let err = arm
        .gateway()
        .set_instance_protection(&scale_set(), "3", ProtectionPolicy::protected())
        .await
        .unwrap_err();

    match err {
        ProviderError::Api {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 409);
            assert_eq!(code, "OperationNotAllowed");
            assert_eq!(message, "instance is being deleted");
        }
        other => panic!("expected api error, got {other:?}"),
    }
}

#[tokio::test]
async fn listing_follows_next_link_without_reapplying_filter() {
    let arm = MockArm::start(|req, base| match (req.method.as_str(), req.target.as_str()) {
        ("GET", t) if t.contains("/virtualMachines?") => StubResponse::json(
            200,
            json!({
                "value": [vm("4", true), vm("5", true)],
                "nextLink": format!("{base}/pages/2")
            }),
        ),
        ("GET", "/pages/2") => StubResponse::json(200, json!({"value": [vm("6", true)]})),
        _ => not_found(),
    })
    .await;

    let gw = arm.gateway();
    let set = scale_set();
    let records: Vec<_> = gw
        .list_instances(&set, LATEST_MODEL_FILTER)
        .try_collect()
        .await
        .unwrap();

    let ids: Vec<_> = records.iter().map(|r| r.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["4", "5", "6"]);
    assert!(records.iter().all(|r| r.latest_model_applied));

    let requests = arm.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].1.contains("filter="));
    assert_eq!(requests[1].1, "/pages/2");
}

#[tokio::test]
async fn empty_filter_is_not_sent() {
    let arm = MockArm::start(|req, _| match req.method.as_str() {
        "GET" => StubResponse::json(200, json!({"value": [vm("0", false)]})),
        _ => not_found(),
    })
    .await;

    let gw = arm.gateway();
    let set = scale_set();
    let records: Vec<_> = gw.list_instances(&set, "").try_collect().await.unwrap();

    assert_eq!(records.len(), 1);
    assert!(!records[0].latest_model_applied);
    assert!(!arm.requests()[0].1.contains("filter"));
}

#[tokio::test]
async fn async_operation_is_polled_until_succeeded() {
    let polls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&polls);
    let arm = MockArm::start(move |req, base| match (req.method.as_str(), req.target.as_str()) {
        ("PUT", t) if t.contains("/virtualMachines/3?") => StubResponse::json(202, json!({}))
            .header("Azure-AsyncOperation", format!("{base}/operations/op-1")),
        ("GET", "/operations/op-1") => {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                StubResponse::json(200, json!({"status": "InProgress"})).header("Retry-After", "0")
            } else {
                StubResponse::json(200, json!({"status": "Succeeded"}))
            }
        }
        ("GET", t) if t.contains("/virtualMachines/3?") => {
            StubResponse::json(200, json!({"name": "web_3"}))
        }
        _ => not_found(),
    })
    .await;

    let gw = arm.gateway();
    let op = gw
        .set_instance_protection(&scale_set(), "3", ProtectionPolicy::protected())
        .await
        .unwrap();
    arm.with_request(0, |req| {
        let body: Value = serde_json::from_str(&req.body).unwrap();
        assert_eq!(
            body,
            json!({"properties": {"protectionPolicy": {
                "protectFromScaleIn": true,
                "protectFromScaleSetActions": false
            }}})
        );
    });

    let started = Instant::now();
    let applied = gw.await_operation(op).await.unwrap();

    assert_eq!(applied.resource_name, "web_3");
    assert_eq!(polls.load(Ordering::SeqCst), 2);
    // Retry-After: 0 still waits the minimum interval.
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn failed_operation_reports_provider_error() {
    let arm = MockArm::start(|req, base| match (req.method.as_str(), req.target.as_str()) {
        ("PUT", _) => StubResponse::json(202, json!({}))
            .header("Azure-AsyncOperation", format!("{base}/operations/op-9")),
        ("GET", "/operations/op-9") => StubResponse::json(
            200,
            json!({
                "status": "Failed",
                "error": {"code": "InternalExecutionError", "message": "protection update failed"}
            }),
        ),
        _ => not_found(),
    })
    .await;

    let gw = arm.gateway();
    let op = gw
        .set_instance_protection(&scale_set(), "5", ProtectionPolicy::unprotected())
        .await
        .unwrap();
    let err = gw.await_operation(op).await.unwrap_err();

    match err {
        ProviderError::OperationFailed {
            target,
            status,
            message,
        } => {
            assert_eq!(target, "instance 5");
            assert_eq!(status, "Failed");
            assert!(message.contains("InternalExecutionError"));
        }
        other => panic!("expected failed operation, got {other:?}"),
    }
    // Submit and one poll; the resource is not read back after a failure.
    let requests = arm.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].1, "/operations/op-9");
}

#[tokio::test]
async fn capacity_update_echoes_sku_and_polls_location() {
    let polls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&polls);
    let arm = MockArm::start(move |req, base| match (req.method.as_str(), req.target.as_str()) {
        ("PATCH", _) => StubResponse::json(202, json!({}))
            .header("Location", format!("{base}/locations/1")),
        ("GET", "/locations/1") => {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                StubResponse::json(202, json!({})).header("Retry-After", "1")
            } else {
                StubResponse::json(200, json!({}))
            }
        }
        ("GET", t) if t.contains("/virtualMachineScaleSets/web?") => {
            StubResponse::json(200, json!({"name": "web"}))
        }
        _ => not_found(),
    })
    .await;

    let gw = arm.gateway();
    let op = gw.update_capacity(&scale_set(), &snapshot(), 8).await.unwrap();
    arm.with_request(0, |req| {
        let body: Value = serde_json::from_str(&req.body).unwrap();
        assert_eq!(
            body,
            json!({"sku": {"name": "Standard_D2s_v3", "tier": "Standard", "capacity": 8}})
        );
    });

    let applied = gw.await_operation(op).await.unwrap();
    assert_eq!(applied.resource_name, "web");
    assert_eq!(polls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn response_without_poll_header_is_already_done() {
    let arm = MockArm::start(|req, _| match req.method.as_str() {
        "PUT" => StubResponse::json(200, json!({"name": "web_2"})),
        "GET" => StubResponse::json(200, json!({"name": "web_2"})),
        _ => not_found(),
    })
    .await;

    let gw = arm.gateway();
    let op = gw
        .set_instance_protection(&scale_set(), "2", ProtectionPolicy::protected())
        .await
        .unwrap();
    let applied = gw.await_operation(op).await.unwrap();

    assert_eq!(applied.resource_name, "web_2");
    let methods: Vec<_> = arm.requests().into_iter().map(|(m, _)| m).collect();
    assert_eq!(methods, vec!["PUT", "GET"]);
}
