#![allow(dead_code)]

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{ErrorCode, ErrorData};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use unrelated_namespace_gateway::{
    access::StaticAccess,
    aggregator::{AggregatorFactory, AggregatorSettings},
    backend::{
        BackendConnection, BackendConnector, CallError, Connected, DiscoveredCapabilities,
        NotificationSink, push_notification,
    },
    config::{BackendDescriptor, BackendTransport, EndpointConfig, NamespaceConfig},
    error::{GatewayError, Result},
    http::{self, GatewayState, HEADER_SESSION_ID},
    jsonrpc::JsonObject,
    pool::{IdlePool, PoolConfig},
    session::SessionRegistry,
};

pub const NO_KEYS: &[&str] = &[];

/// Scripted in-memory backend.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    pub id: String,
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    pub prompts: Vec<String>,
    pub fail_connect: bool,
    pub connect_delay: Duration,
    /// Per-tool artificial latency.
    pub call_delay: HashMap<String, Duration>,
    /// Calling one of these tools drops the connection.
    pub disconnect_on: HashSet<String>,
    /// Calling one of these tools returns a JSON-RPC error from the backend.
    pub rpc_error_on: HashSet<String>,
    /// Progress notifications emitted before each `tools/call` reply.
    pub progress_per_call: usize,
    /// How long tearing the connection down takes.
    pub close_delay: Duration,
}

impl FakeBackend {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| (*t).to_string()).collect();
        self
    }

    pub fn resources(mut self, uris: &[&str]) -> Self {
        self.resources = uris.iter().map(|u| (*u).to_string()).collect();
        self
    }

    pub fn prompts(mut self, prompts: &[&str]) -> Self {
        self.prompts = prompts.iter().map(|p| (*p).to_string()).collect();
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn slow_tool(mut self, tool: &str, delay: Duration) -> Self {
        self.call_delay.insert(tool.to_string(), delay);
        self
    }

    pub fn disconnect_on(mut self, tool: &str) -> Self {
        self.disconnect_on.insert(tool.to_string());
        self
    }

    pub fn rpc_error_on(mut self, tool: &str) -> Self {
        self.rpc_error_on.insert(tool.to_string());
        self
    }

    pub fn progress_per_call(mut self, n: usize) -> Self {
        self.progress_per_call = n;
        self
    }

    pub fn slow_close(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            id: self.id.clone(),
            transport: BackendTransport::Http {
                url: format!("http://fake.invalid/{}/mcp", self.id),
                headers: HashMap::new(),
            },
        }
    }

    fn capabilities(&self) -> DiscoveredCapabilities {
        let obj = |v: Value| match v {
            Value::Object(o) => o,
            _ => JsonObject::new(),
        };
        DiscoveredCapabilities {
            tools: self
                .tools
                .iter()
                .map(|t| {
                    obj(json!({
                        "name": t,
                        "description": format!("{t} from {}", self.id),
                        "inputSchema": { "type": "object" },
                    }))
                })
                .collect(),
            resources: self
                .resources
                .iter()
                .map(|u| obj(json!({ "uri": u, "name": u })))
                .collect(),
            resource_templates: Vec::new(),
            prompts: self
                .prompts
                .iter()
                .map(|p| obj(json!({ "name": p })))
                .collect(),
        }
    }
}

/// A call observed by a fake backend.
#[derive(Debug, Clone)]
pub struct ObservedCall {
    pub backend: String,
    pub method: String,
    pub params: JsonObject,
}

#[derive(Debug, Default)]
pub struct FakeStats {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub calls: Mutex<Vec<ObservedCall>>,
}

impl FakeStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<ObservedCall> {
        self.calls.lock().clone()
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    backends: Arc<HashMap<String, FakeBackend>>,
    pub stats: Arc<FakeStats>,
}

impl FakeConnector {
    pub fn new(backends: impl IntoIterator<Item = FakeBackend>) -> Self {
        Self {
            backends: Arc::new(backends.into_iter().map(|b| (b.id.clone(), b)).collect()),
            stats: Arc::new(FakeStats::default()),
        }
    }
}

#[async_trait]
impl BackendConnector for FakeConnector {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        notifications: NotificationSink,
    ) -> Result<Connected> {
        let script = self
            .backends
            .get(&descriptor.id)
            .cloned()
            .ok_or_else(|| GatewayError::BackendUnavailable(format!("no fake '{}'", descriptor.id)))?;
        tokio::time::sleep(script.connect_delay).await;
        if script.fail_connect {
            return Err(GatewayError::BackendUnavailable(format!(
                "fake '{}' refused to start",
                script.id
            )));
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        let capabilities = script.capabilities();
        Ok(Connected {
            connection: Arc::new(FakeConnection {
                script,
                stats: self.stats.clone(),
                notifications,
                dropped: Mutex::new(false),
            }),
            capabilities,
        })
    }
}

struct FakeConnection {
    script: FakeBackend,
    stats: Arc<FakeStats>,
    notifications: NotificationSink,
    dropped: Mutex<bool>,
}

#[async_trait]
impl BackendConnection for FakeConnection {
    async fn request(
        &self,
        method: &str,
        params: Option<JsonObject>,
        _timeout: Duration,
    ) -> std::result::Result<Value, CallError> {
        if *self.dropped.lock() {
            return Err(CallError::Disconnected("connection dropped".to_string()));
        }
        let params = params.unwrap_or_default();
        self.stats.calls.lock().push(ObservedCall {
            backend: self.script.id.clone(),
            method: method.to_string(),
            params: params.clone(),
        });

        let name = params
            .get("name")
            .or_else(|| params.get("uri"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(delay) = self.script.call_delay.get(&name) {
            tokio::time::sleep(*delay).await;
        }
        if self.script.disconnect_on.contains(&name) {
            *self.dropped.lock() = true;
            return Err(CallError::Disconnected(format!("'{}' went away", self.script.id)));
        }
        if self.script.rpc_error_on.contains(&name) {
            return Err(CallError::Rpc(ErrorData::new(
                ErrorCode(-32010),
                format!("{name} refused"),
                Some(json!({ "backend": self.script.id })),
            )));
        }

        match method {
            "tools/call" => {
                for i in 0..self.script.progress_per_call {
                    push_notification(
                        &self.notifications,
                        &self.script.id,
                        json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/progress",
                            "params": { "progressToken": name, "progress": i }
                        }),
                    );
                }
                Ok(json!({
                    "content": [{ "type": "text", "text": format!("{}:{name}", self.script.id) }],
                    "isError": false
                }))
            }
            "resources/read" => Ok(json!({
                "contents": [{ "uri": name, "text": format!("from {}", self.script.id) }]
            })),
            "prompts/get" => Ok(json!({
                "messages": [{ "role": "user", "content": { "type": "text", "text": self.script.id } }]
            })),
            other => Ok(json!({ "echo": other })),
        }
    }

    async fn close(&self) {
        tokio::time::sleep(self.script.close_delay).await;
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct TestOptions {
    pub pool_depth: usize,
    pub max_idle_age: Duration,
    pub startup_timeout: Duration,
    pub call_timeout: Duration,
    pub session_idle_timeout: Option<Duration>,
    pub admin_token: Option<String>,
    pub sse_keep_alive: Duration,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            pool_depth: 0,
            max_idle_age: Duration::from_secs(600),
            startup_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(5),
            session_idle_timeout: None,
            admin_token: None,
            sse_keep_alive: Duration::from_secs(15),
        }
    }
}

pub struct TestGateway {
    pub base: String,
    pub registry: Arc<SessionRegistry>,
    pub pool: Arc<IdlePool>,
    pub connector: FakeConnector,
    pub shutdown: CancellationToken,
}

impl TestGateway {
    /// Start an in-process gateway.
    ///
    /// `namespaces` lists backends in registration order; `endpoints` maps endpoint name to
    /// `(namespace, api keys)`.
    pub async fn start(
        namespaces: &[(&str, Vec<FakeBackend>)],
        endpoints: &[(&str, &str, &[&str])],
        options: TestOptions,
    ) -> anyhow::Result<Self> {
        let connector = FakeConnector::new(
            namespaces
                .iter()
                .flat_map(|(_, backends)| backends.iter().cloned()),
        );
        let namespace_configs: HashMap<String, NamespaceConfig> = namespaces
            .iter()
            .map(|(id, backends)| {
                (
                    (*id).to_string(),
                    NamespaceConfig {
                        servers: backends.iter().map(FakeBackend::descriptor).collect(),
                    },
                )
            })
            .collect();
        let endpoint_configs: HashMap<String, EndpointConfig> = endpoints
            .iter()
            .map(|(name, ns, keys)| {
                (
                    (*name).to_string(),
                    EndpointConfig {
                        namespace: (*ns).to_string(),
                        api_keys: keys.iter().map(|k| (*k).to_string()).collect(),
                        accept_x_api_key: true,
                    },
                )
            })
            .collect();

        let factory = Arc::new(AggregatorFactory::new(
            namespace_configs,
            Arc::new(connector.clone()),
            AggregatorSettings {
                startup_timeout: options.startup_timeout,
                call_timeout: options.call_timeout,
            },
        ));
        let pool = IdlePool::new(
            factory,
            PoolConfig {
                depth: options.pool_depth,
                max_idle_age: options.max_idle_age,
                backoff_min: Duration::from_millis(10),
                backoff_max: Duration::from_millis(100),
                startup_timeout: options.startup_timeout,
            },
        );
        let registry = SessionRegistry::new(pool.clone(), options.session_idle_timeout);
        let access = Arc::new(StaticAccess::new(endpoint_configs));
        let shutdown = CancellationToken::new();
        let state = Arc::new(GatewayState {
            registry: registry.clone(),
            resolver: access.clone(),
            verifier: access,
            sse_keep_alive: options.sse_keep_alive,
            admin_token: options.admin_token.clone(),
            start_time: Instant::now(),
            shutdown: shutdown.clone(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind test listener")?;
        let addr = listener.local_addr().context("test listener addr")?;
        let app = http::router(state);
        let server_ct = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_ct.cancelled().await })
                .await;
        });

        Ok(Self {
            base: format!("http://{addr}"),
            registry,
            pool,
            connector,
            shutdown,
        })
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}/session", self.base)
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.registry.shutdown_all().await;
        self.pool.shutdown().await;
    }
}

pub fn rpc(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub fn initialize_request(id: u64) -> Value {
    rpc(
        id,
        "initialize",
        json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "0.0.0" }
        }),
    )
}

pub async fn post(
    client: &reqwest::Client,
    url: &str,
    session_id: Option<&str>,
    body: &Value,
) -> anyhow::Result<reqwest::Response> {
    let mut req = client
        .post(url)
        .header("Accept", "application/json, text/event-stream")
        .json(body);
    if let Some(session_id) = session_id {
        req = req.header(HEADER_SESSION_ID, session_id);
    }
    req.send().await.context("POST session")
}

pub async fn delete(
    client: &reqwest::Client,
    url: &str,
    session_id: Option<&str>,
) -> anyhow::Result<reqwest::Response> {
    let mut req = client.delete(url);
    if let Some(session_id) = session_id {
        req = req.header(HEADER_SESSION_ID, session_id);
    }
    req.send().await.context("DELETE session")
}

/// Open a session with `initialize` and return its id.
pub async fn open_session(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let resp = post(client, url, None, &initialize_request(1)).await?;
    anyhow::ensure!(
        resp.status().is_success(),
        "initialize failed: {}",
        resp.status()
    );
    let session_id = resp
        .headers()
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .context("missing session id header")?
        .to_string();
    Ok(session_id)
}

/// POST a request within a session and return the JSON-RPC reply body.
pub async fn call(
    client: &reqwest::Client,
    url: &str,
    session_id: &str,
    body: &Value,
) -> anyhow::Result<Value> {
    let resp = post(client, url, Some(session_id), body).await?;
    anyhow::ensure!(resp.status().is_success(), "call failed: {}", resp.status());
    resp.json().await.context("decode JSON-RPC reply")
}

pub fn tool_names(list_reply: &Value) -> HashSet<String> {
    list_reply["result"]["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn text_of(call_reply: &Value) -> Option<&str> {
    call_reply["result"]["content"][0]["text"].as_str()
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Read `n` `data:` payloads from an SSE response, skipping keep-alive comments.
pub async fn read_sse_events(
    resp: &mut reqwest::Response,
    n: usize,
    timeout: Duration,
) -> anyhow::Result<Vec<Value>> {
    let mut buf = String::new();
    let mut events = Vec::new();
    let deadline = Instant::now() + timeout;
    while events.len() < n {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let chunk = tokio::time::timeout(remaining, resp.chunk())
            .await
            .context("timed out waiting for SSE events")??
            .context("SSE stream ended early")?;
        buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(end) = buf.find("\n\n") {
            let frame: String = buf.drain(..end + 2).collect();
            let data: Vec<&str> = frame
                .lines()
                .filter_map(|l| l.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            if !data.is_empty() {
                events.push(serde_json::from_str(&data.join("\n")).context("decode SSE data")?);
            }
        }
    }
    Ok(events)
}
