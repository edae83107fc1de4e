//! Namespace Aggregator.
//!
//! One aggregator instance owns the backend handles of one namespace for one session. It merges
//! their capability lists under qualified names (`<backendId>:<name>`) plus unqualified aliases,
//! answers the listing methods itself and routes everything else to the owning backend.
//!
//! Alias collisions resolve last-registered-wins in descriptor order; the shadowed backend stays
//! reachable through its qualified name.

use crate::backend::{
    BackendConnector, BackendHandle, BackendStatus, DiscoveredCapabilities, PUSH_QUEUE_CAPACITY,
};
use crate::config::NamespaceConfig;
use crate::error::{GatewayError, Result};
use crate::jsonrpc::JsonObject;
use parking_lot::Mutex;
use rmcp::model::{ErrorCode, ErrorData, RequestId};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const QUALIFIED_SEPARATOR: char = ':';

const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";
const VERSION: &str = env!("CARGO_PKG_VERSION");

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

pub fn qualify(backend_id: &str, name: &str) -> String {
    format!("{backend_id}{QUALIFIED_SEPARATOR}{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    /// Field that carries the routable name inside a capability object / call params.
    fn key_field(self) -> &'static str {
        match self {
            CapabilityKind::Tool | CapabilityKind::Prompt => "name",
            CapabilityKind::Resource => "uri",
        }
    }

    fn items(self, caps: &DiscoveredCapabilities) -> &[JsonObject] {
        match self {
            CapabilityKind::Tool => &caps.tools,
            CapabilityKind::Resource => &caps.resources,
            CapabilityKind::Prompt => &caps.prompts,
        }
    }
}

/// An unqualified name advertised by more than one backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityCollision {
    pub kind: CapabilityKind,
    pub name: String,
    /// Backend the alias now resolves to.
    pub winner: String,
    pub shadowed: String,
}

#[derive(Debug, Clone)]
struct Route {
    backend: usize,
    original: String,
}

#[derive(Debug, Default)]
struct CapabilityMap {
    routes: HashMap<String, Route>,
    listing: Vec<Value>,
}

impl CapabilityMap {
    fn build(
        kind: CapabilityKind,
        backends: &[Arc<BackendHandle>],
        collisions: &mut Vec<CapabilityCollision>,
    ) -> Self {
        let field = kind.key_field();
        let mut map = CapabilityMap::default();
        let mut alias_order: Vec<String> = Vec::new();
        let mut alias_owner: HashMap<String, (usize, JsonObject)> = HashMap::new();

        for (idx, handle) in backends.iter().enumerate() {
            if !handle.is_ready() {
                continue;
            }
            let caps = handle.capabilities();
            for item in kind.items(&caps) {
                let Some(name) = item.get(field).and_then(Value::as_str) else {
                    continue;
                };

                let qualified = qualify(handle.id(), name);
                let mut exposed = item.clone();
                exposed.insert(field.to_string(), Value::String(qualified.clone()));
                map.listing.push(Value::Object(exposed));
                map.routes.insert(
                    qualified,
                    Route {
                        backend: idx,
                        original: name.to_string(),
                    },
                );

                match alias_owner.insert(name.to_string(), (idx, item.clone())) {
                    None => alias_order.push(name.to_string()),
                    Some((prev, _)) if prev != idx => collisions.push(CapabilityCollision {
                        kind,
                        name: name.to_string(),
                        winner: handle.id().to_string(),
                        shadowed: backends[prev].id().to_string(),
                    }),
                    Some(_) => {}
                }
            }
        }

        for name in alias_order {
            let Some((idx, item)) = alias_owner.remove(&name) else {
                continue;
            };
            if map.routes.contains_key(&name) {
                // A backend advertises a name that looks qualified; the qualified route wins.
                tracing::warn!(
                    kind = ?kind,
                    name = %name,
                    backend = %backends[idx].id(),
                    "unqualified name shadows a qualified name; alias not exposed"
                );
                continue;
            }
            map.listing.push(Value::Object(item));
            map.routes.insert(
                name.clone(),
                Route {
                    backend: idx,
                    original: name,
                },
            );
        }
        map
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Aggregator timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorSettings {
    /// Per-backend bound on connect + discovery.
    pub startup_timeout: Duration,
    /// Default bound on a forwarded call.
    pub call_timeout: Duration,
}

/// Merged capability surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityListing {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub resource_templates: Vec<Value>,
    pub prompts: Vec<Value>,
}

struct InFlightCall {
    call_id: u64,
    cancel: CancellationToken,
}

/// Unregisters a forwarded call however `forward` ends, including when its future is dropped.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<String, InFlightCall>>,
    key: &'a str,
    call_id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        // A reused request id may have replaced the entry; leave that one alone.
        if in_flight.get(self.key).is_some_and(|c| c.call_id == self.call_id) {
            in_flight.remove(self.key);
        }
    }
}

pub struct Aggregator {
    instance_id: u64,
    namespace_id: String,
    backends: Vec<Arc<BackendHandle>>,
    tools: CapabilityMap,
    resources: CapabilityMap,
    prompts: CapabilityMap,
    resource_templates: Vec<Value>,
    template_owners: HashMap<String, usize>,
    collisions: Vec<CapabilityCollision>,
    call_timeout: Duration,
    next_call_id: AtomicU64,
    in_flight: Mutex<HashMap<String, InFlightCall>>,
    notifications: Mutex<Option<mpsc::Receiver<Value>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("instance_id", &self.instance_id)
            .field("namespace_id", &self.namespace_id)
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Connect every backend of the namespace concurrently, each under its own startup timeout.
    ///
    /// Backends that fail are kept as failed handles and excluded from routing. Fails with
    /// `BackendUnavailable` only when no backend became ready.
    pub async fn initialize(
        namespace_id: &str,
        namespace: &NamespaceConfig,
        connector: &dyn BackendConnector,
        settings: AggregatorSettings,
    ) -> Result<Self> {
        let started = Instant::now();
        let (tx, rx) = mpsc::channel(PUSH_QUEUE_CAPACITY);

        let backends: Vec<Arc<BackendHandle>> = namespace
            .servers
            .iter()
            .map(|d| Arc::new(BackendHandle::new(d)))
            .collect();

        let starts = backends.iter().zip(&namespace.servers).map(|(handle, descriptor)| {
            handle.start(connector, descriptor, tx.clone(), settings.startup_timeout)
        });
        // Failures are recorded on the handles themselves.
        let _ = futures::future::join_all(starts).await;
        drop(tx);

        let ready = backends.iter().filter(|h| h.is_ready()).count();
        if ready == 0 {
            for handle in &backends {
                handle.close().await;
            }
            return Err(GatewayError::BackendUnavailable(format!(
                "no backend in namespace '{namespace_id}' became ready ({} configured)",
                backends.len()
            )));
        }

        let mut collisions = Vec::new();
        let tools = CapabilityMap::build(CapabilityKind::Tool, &backends, &mut collisions);
        let resources = CapabilityMap::build(CapabilityKind::Resource, &backends, &mut collisions);
        let prompts = CapabilityMap::build(CapabilityKind::Prompt, &backends, &mut collisions);

        let mut resource_templates = Vec::new();
        let mut template_owners = HashMap::new();
        for (idx, handle) in backends.iter().enumerate().filter(|(_, h)| h.is_ready()) {
            for template in handle.capabilities().resource_templates {
                if let Some(uri) = template.get("uriTemplate").and_then(Value::as_str) {
                    template_owners.insert(uri.to_string(), idx);
                }
                resource_templates.push(Value::Object(template));
            }
        }

        for c in &collisions {
            tracing::warn!(
                namespace = %namespace_id,
                kind = ?c.kind,
                name = %c.name,
                winner = %c.winner,
                shadowed = %c.shadowed,
                "capability name collision; unqualified alias resolves to the later backend"
            );
        }

        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            namespace = %namespace_id,
            instance_id,
            ready,
            failed = backends.len() - ready,
            elapsed = ?started.elapsed(),
            "Aggregator initialized"
        );

        Ok(Self {
            instance_id,
            namespace_id: namespace_id.to_string(),
            backends,
            tools,
            resources,
            prompts,
            resource_templates,
            template_owners,
            collisions,
            call_timeout: settings.call_timeout,
            next_call_id: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
            notifications: Mutex::new(Some(rx)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    pub fn collisions(&self) -> &[CapabilityCollision] {
        &self.collisions
    }

    /// Process-unique ids of the handles this instance owns.
    pub fn handle_ids(&self) -> Vec<u64> {
        self.backends.iter().map(|h| h.handle_id()).collect()
    }

    pub fn backend_status(&self) -> Vec<BackendStatus> {
        self.backends.iter().map(|h| h.status()).collect()
    }

    pub fn live_backends(&self) -> usize {
        self.backends.iter().filter(|h| h.is_ready()).count()
    }

    /// Routable names (qualified and aliases) for one capability kind, sorted.
    pub fn capability_names(&self, kind: CapabilityKind) -> Vec<String> {
        self.map(kind).names()
    }

    /// Merged listing of every ready backend's capabilities.
    pub fn list_capabilities(&self) -> CapabilityListing {
        CapabilityListing {
            tools: self.tools.listing.clone(),
            resources: self.resources.listing.clone(),
            resource_templates: self.resource_templates.clone(),
            prompts: self.prompts.listing.clone(),
        }
    }

    /// Take the server-push queue. Only the first caller gets it.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<Value>> {
        self.notifications.lock().take()
    }

    /// Drop everything queued so far. Returns how many notifications were discarded.
    pub fn discard_pending_notifications(&self) -> usize {
        let mut guard = self.notifications.lock();
        let Some(rx) = guard.as_mut() else {
            return 0;
        };
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    fn map(&self, kind: CapabilityKind) -> &CapabilityMap {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }

    /// Dispatch one client request. Errors are JSON-RPC error objects for the same id.
    pub async fn handle_request(
        &self,
        id: &RequestId,
        method: &str,
        params: Option<JsonObject>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Value, ErrorData> {
        let routed = match method {
            "initialize" => return Ok(self.initialize_result(params.as_ref())),
            "ping" | "logging/setLevel" => return Ok(json!({})),
            "tools/list" => return Ok(json!({ "tools": self.tools.listing })),
            "resources/list" => return Ok(json!({ "resources": self.resources.listing })),
            "resources/templates/list" => {
                return Ok(json!({ "resourceTemplates": self.resource_templates }));
            }
            "prompts/list" => return Ok(json!({ "prompts": self.prompts.listing })),
            "tools/call" => self.invoke(CapabilityKind::Tool, method, params, id, cancel).await,
            "prompts/get" => self.invoke(CapabilityKind::Prompt, method, params, id, cancel).await,
            "resources/read" | "resources/subscribe" | "resources/unsubscribe" => {
                self.invoke(CapabilityKind::Resource, method, params, id, cancel)
                    .await
            }
            "completion/complete" => self.complete(params, id, cancel).await,
            other => {
                return Err(ErrorData::new(
                    ErrorCode::METHOD_NOT_FOUND,
                    format!("method '{other}' is not supported"),
                    None,
                ));
            }
        };
        routed.map_err(|e| e.to_rpc_error())
    }

    /// Handle a client notification. Only `notifications/cancelled` has an effect.
    pub fn handle_notification(&self, method: &str, params: Option<&JsonObject>) {
        if method != "notifications/cancelled" {
            tracing::debug!(namespace = %self.namespace_id, method, "client notification ignored");
            return;
        }
        let Some(request_id) = params.and_then(|p| p.get("requestId")) else {
            return;
        };
        if let Some(call) = self.in_flight.lock().get(&request_id.to_string()) {
            tracing::debug!(namespace = %self.namespace_id, request_id = %request_id, "client cancelled call");
            call.cancel.cancel();
        }
    }

    /// Resolve `params[<key>]` to its owning backend, rewrite it to the backend's own name and
    /// forward the call. The reply is returned for `correlation_id`.
    pub async fn invoke(
        &self,
        kind: CapabilityKind,
        method: &str,
        params: Option<JsonObject>,
        correlation_id: &RequestId,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let field = kind.key_field();
        let mut params = params.unwrap_or_default();
        let Some(name) = params.get(field).and_then(Value::as_str).map(str::to_string) else {
            return Err(GatewayError::BadRequest(format!(
                "{method}: missing '{field}'"
            )));
        };
        let route = self
            .map(kind)
            .routes
            .get(&name)
            .cloned()
            .ok_or_else(|| GatewayError::CapabilityNotFound(name.clone()))?;
        params.insert(field.to_string(), Value::String(route.original));

        self.forward(route.backend, method, params, correlation_id, cancel)
            .await
    }

    async fn complete(
        &self,
        params: Option<JsonObject>,
        correlation_id: &RequestId,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut params = params.unwrap_or_default();
        let reference = params
            .get("ref")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| GatewayError::BadRequest("completion/complete: missing 'ref'".into()))?;

        let (kind, field) = match reference.get("type").and_then(Value::as_str) {
            Some("ref/prompt") => (CapabilityKind::Prompt, "name"),
            Some("ref/resource") => (CapabilityKind::Resource, "uri"),
            other => {
                return Err(GatewayError::BadRequest(format!(
                    "completion/complete: unsupported ref type {other:?}"
                )));
            }
        };
        let name = reference
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::BadRequest(format!("completion/complete: missing ref.{field}")))?;

        let (backend, original) = match self.map(kind).routes.get(name) {
            Some(route) => (route.backend, route.original.clone()),
            None => match self.template_owners.get(name) {
                Some(idx) if kind == CapabilityKind::Resource => (*idx, name.to_string()),
                _ => return Err(GatewayError::CapabilityNotFound(name.to_string())),
            },
        };

        let mut reference = reference;
        reference.insert(field.to_string(), Value::String(original));
        params.insert("ref".to_string(), Value::Object(reference));
        self.forward(backend, "completion/complete", params, correlation_id, cancel)
            .await
    }

    async fn forward(
        &self,
        backend: usize,
        method: &str,
        params: JsonObject,
        correlation_id: &RequestId,
        session_cancel: &CancellationToken,
    ) -> Result<Value> {
        let handle = self
            .backends
            .get(backend)
            .ok_or_else(|| GatewayError::Internal(format!("dangling backend route {backend}")))?;
        let budget = timeout_budget(&params, self.call_timeout);

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let call_cancel = session_cancel.child_token();
        let key = correlation_key(correlation_id);
        self.in_flight.lock().insert(
            key.clone(),
            InFlightCall {
                call_id,
                cancel: call_cancel.clone(),
            },
        );
        let _registered = InFlightGuard {
            in_flight: &self.in_flight,
            key: &key,
            call_id,
        };

        let started = Instant::now();
        let outcome = tokio::select! {
            r = tokio::time::timeout(budget, handle.request(method, Some(params), budget)) => match r {
                Ok(r) => r,
                Err(_) => Err(GatewayError::backend(format!(
                    "backend '{}' {method} timed out after {}ms",
                    handle.id(),
                    budget.as_millis()
                ))),
            },
            () = call_cancel.cancelled() => Err(GatewayError::backend(format!(
                "{method} to backend '{}' was cancelled",
                handle.id()
            ))),
        };

        match &outcome {
            Ok(_) => tracing::debug!(
                namespace = %self.namespace_id,
                backend = %handle.id(),
                request_id = %key,
                method,
                elapsed = ?started.elapsed(),
                "call ok"
            ),
            Err(e) => tracing::debug!(
                namespace = %self.namespace_id,
                backend = %handle.id(),
                request_id = %key,
                method,
                elapsed = ?started.elapsed(),
                error = %e,
                "call failed"
            ),
        }
        outcome
    }

    fn initialize_result(&self, params: Option<&JsonObject>) -> Value {
        let protocol_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);

        let mut capabilities = JsonObject::new();
        capabilities.insert("logging".to_string(), json!({}));
        if !self.tools.listing.is_empty() {
            capabilities.insert("tools".to_string(), json!({ "listChanged": true }));
        }
        if !self.resources.listing.is_empty() || !self.resource_templates.is_empty() {
            capabilities.insert(
                "resources".to_string(),
                json!({ "subscribe": true, "listChanged": true }),
            );
        }
        if !self.prompts.listing.is_empty() {
            capabilities.insert("prompts".to_string(), json!({ "listChanged": true }));
        }
        if !self.prompts.listing.is_empty() || !self.resource_templates.is_empty() {
            capabilities.insert("completions".to_string(), json!({}));
        }

        json!({
            "protocolVersion": protocol_version,
            "capabilities": capabilities,
            "serverInfo": {
                "name": format!("unrelated-namespace-gateway/{}", self.namespace_id),
                "version": VERSION,
            },
        })
    }

    /// Close every owned backend handle; already-closed handles are skipped.
    ///
    /// Returns the number of handles actually closed by this call.
    pub async fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        for call in self.in_flight.lock().drain().map(|(_, c)| c) {
            call.cancel.cancel();
        }
        let closed = futures::future::join_all(self.backends.iter().map(|h| h.close()))
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count();
        tracing::info!(
            namespace = %self.namespace_id,
            instance_id = self.instance_id,
            closed,
            "Aggregator shut down"
        );
        closed
    }
}

/// In-flight calls are keyed by the id's JSON text, as `notifications/cancelled` carries it.
fn correlation_key(id: &RequestId) -> String {
    serde_json::to_value(id)
        .map(|v| v.to_string())
        .unwrap_or_default()
}

/// Per-call budget from `_meta.unrelated.timeoutMs`, clamped to the configured call timeout.
fn timeout_budget(params: &JsonObject, call_timeout: Duration) -> Duration {
    let requested = params
        .get("_meta")
        .and_then(|m| m.get("unrelated"))
        .and_then(|u| u.get("timeoutMs"))
        .and_then(Value::as_u64)
        .filter(|ms| *ms > 0);
    match requested {
        Some(ms) => Duration::from_millis(ms).min(call_timeout),
        None => call_timeout,
    }
}

/// Builds aggregator instances for configured namespaces.
pub struct AggregatorFactory {
    namespaces: HashMap<String, NamespaceConfig>,
    connector: Arc<dyn BackendConnector>,
    settings: AggregatorSettings,
}

impl AggregatorFactory {
    pub fn new(
        namespaces: HashMap<String, NamespaceConfig>,
        connector: Arc<dyn BackendConnector>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            namespaces,
            connector,
            settings,
        }
    }

    pub fn namespace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.namespaces.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_namespace(&self, namespace_id: &str) -> bool {
        self.namespaces.contains_key(namespace_id)
    }

    pub async fn build(&self, namespace_id: &str) -> Result<Aggregator> {
        let namespace = self.namespaces.get(namespace_id).ok_or_else(|| {
            GatewayError::BackendUnavailable(format!("namespace '{namespace_id}' is not configured"))
        })?;
        Aggregator::initialize(
            namespace_id,
            namespace,
            self.connector.as_ref(),
            self.settings,
        )
        .await
    }
}
