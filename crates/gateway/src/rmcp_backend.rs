//! Production backend connector built on rmcp.
//!
//! Stdio backends are spawned as child processes (`TokioChildProcess`, killed on drop); remote
//! backends are reached over streamable HTTP. Calls are forwarded as opaque JSON: the envelope is
//! re-typed into an rmcp `ClientRequest` only so the rmcp peer can correlate and time it out.

use crate::backend::{
    BackendConnection, BackendConnector, CallError, Connected, DiscoveredCapabilities,
    NotificationSink, push_notification,
};
use crate::config::{BackendDescriptor, BackendTransport};
use crate::error::{GatewayError, Result};
use crate::jsonrpc::{self, JsonObject};
use async_trait::async_trait;
use rmcp::{
    ClientHandler, RoleClient, ServiceExt,
    model::{
        ClientInfo, ClientRequest, LoggingMessageNotificationParam, ProgressNotificationParam,
        ResourceUpdatedNotificationParam,
    },
    service::{NotificationContext, Peer, PeerRequestOptions, RunningService, ServiceError},
    transport::{
        StreamableHttpClientTransport, TokioChildProcess,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Type alias for the rmcp running client service
type McpClient = RunningService<RoleClient, ProxyClientHandler>;

/// Client-side handler that relays backend notifications into the owning aggregator's queue.
#[derive(Clone)]
struct ProxyClientHandler {
    backend_id: String,
    notifications: NotificationSink,
}

impl ProxyClientHandler {
    fn forward(&self, method: &str, params: Option<Value>) {
        tracing::trace!(backend = %self.backend_id, method, "forwarding backend notification");
        push_notification(
            &self.notifications,
            &self.backend_id,
            jsonrpc::notification(method, params),
        );
    }

    fn forward_params<P: Serialize>(&self, method: &str, params: &P) {
        match serde_json::to_value(params) {
            Ok(v) => self.forward(method, Some(v)),
            Err(e) => {
                tracing::debug!(backend = %self.backend_id, method, error = %e, "dropping unserializable notification");
            }
        }
    }
}

impl std::fmt::Debug for ProxyClientHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClientHandler")
            .field("backend_id", &self.backend_id)
            .finish_non_exhaustive()
    }
}

impl ClientHandler for ProxyClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo::default()
    }

    fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward_params("notifications/progress", &params);
        std::future::ready(())
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward_params("notifications/message", &params);
        std::future::ready(())
    }

    fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward_params("notifications/resources/updated", &params);
        std::future::ready(())
    }

    fn on_resource_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward("notifications/resources/list_changed", None);
        std::future::ready(())
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward("notifications/tools/list_changed", None);
        std::future::ready(())
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward("notifications/prompts/list_changed", None);
        std::future::ready(())
    }
}

/// Connects stdio and streamable-HTTP backends through rmcp.
#[derive(Debug, Clone, Default)]
pub struct RmcpConnector;

#[async_trait]
impl BackendConnector for RmcpConnector {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        notifications: NotificationSink,
    ) -> Result<Connected> {
        let handler = ProxyClientHandler {
            backend_id: descriptor.id.clone(),
            notifications,
        };
        let client = connect_client(descriptor, handler).await?;

        if let Some(server_info) = client.peer_info() {
            tracing::info!(
                "MCP server '{}' connected: name={}, version={}",
                descriptor.id,
                server_info.server_info.name,
                server_info.server_info.version,
            );
        }

        let capabilities = match discover(&client, &descriptor.id).await {
            Ok(c) => c,
            Err(e) => {
                let _ = client.cancel().await;
                return Err(e);
            }
        };

        let peer = client.peer().clone();
        Ok(Connected {
            connection: Arc::new(RmcpConnection {
                backend_id: descriptor.id.clone(),
                peer,
                client: Mutex::new(Some(client)),
            }),
            capabilities,
        })
    }
}

async fn connect_client(
    descriptor: &BackendDescriptor,
    handler: ProxyClientHandler,
) -> Result<McpClient> {
    let name = &descriptor.id;
    match &descriptor.transport {
        BackendTransport::Stdio { command, args, env } => {
            let mut cmd = Command::new(command);
            cmd.args(args);
            for (key, value) in env {
                cmd.env(key, value);
            }

            let transport = TokioChildProcess::new(cmd).map_err(|e| {
                GatewayError::BackendUnavailable(format!("Failed to spawn '{name}': {e}"))
            })?;

            handler.serve(transport).await.map_err(|e| {
                GatewayError::BackendUnavailable(format!("Failed to connect to '{name}': {e}"))
            })
        }
        BackendTransport::Http { url, headers } => {
            let mut default_headers = reqwest::header::HeaderMap::new();
            for (key, value) in headers {
                let header_name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| {
                        GatewayError::Config(format!("'{name}': invalid header name '{key}': {e}"))
                    })?;
                let header_value = reqwest::header::HeaderValue::from_str(value).map_err(|e| {
                    GatewayError::Config(format!("'{name}': invalid value for header '{key}': {e}"))
                })?;
                default_headers.insert(header_name, header_value);
            }
            let http = reqwest::Client::builder()
                .default_headers(default_headers)
                .build()
                .map_err(|e| GatewayError::Internal(format!("http client for '{name}': {e}")))?;

            let transport = StreamableHttpClientTransport::with_client(
                http,
                StreamableHttpClientTransportConfig::with_uri(url.clone()),
            );

            handler.serve(transport).await.map_err(|e| {
                GatewayError::BackendUnavailable(format!("Failed to connect to '{name}': {e}"))
            })
        }
    }
}

/// List tools/resources/templates/prompts, skipping capabilities the server did not advertise.
async fn discover(client: &McpClient, name: &str) -> Result<DiscoveredCapabilities> {
    let advertised = client.peer_info().map(|info| info.capabilities.clone());
    let has_tools = advertised.as_ref().is_none_or(|c| c.tools.is_some());
    let has_resources = advertised.as_ref().is_none_or(|c| c.resources.is_some());
    let has_prompts = advertised.as_ref().is_none_or(|c| c.prompts.is_some());

    let startup_err = |what: &str, e: ServiceError| {
        GatewayError::BackendUnavailable(format!("Failed to list {what} from '{name}': {e}"))
    };

    let mut caps = DiscoveredCapabilities::default();
    if has_tools {
        let tools = client
            .list_all_tools()
            .await
            .map_err(|e| startup_err("tools", e))?;
        caps.tools = to_objects(&tools);
    }
    if has_resources {
        let resources = client
            .list_all_resources()
            .await
            .map_err(|e| startup_err("resources", e))?;
        caps.resources = to_objects(&resources);
        let templates = client
            .list_all_resource_templates()
            .await
            .map_err(|e| startup_err("resource templates", e))?;
        caps.resource_templates = to_objects(&templates);
    }
    if has_prompts {
        let prompts = client
            .list_all_prompts()
            .await
            .map_err(|e| startup_err("prompts", e))?;
        caps.prompts = to_objects(&prompts);
    }
    Ok(caps)
}

fn to_objects<T: Serialize>(items: &[T]) -> Vec<JsonObject> {
    items
        .iter()
        .filter_map(|item| match serde_json::to_value(item) {
            Ok(Value::Object(obj)) => Some(obj),
            _ => None,
        })
        .collect()
}

struct RmcpConnection {
    backend_id: String,
    peer: Peer<RoleClient>,
    client: Mutex<Option<McpClient>>,
}

fn call_error(err: ServiceError, timeout: Duration) -> CallError {
    match err {
        ServiceError::McpError(e) => CallError::Rpc(e),
        ServiceError::Timeout { .. } => CallError::Timeout(timeout),
        ServiceError::TransportClosed | ServiceError::TransportSend(_) => {
            CallError::Disconnected(err.to_string())
        }
        other => CallError::Other(other.to_string()),
    }
}

#[async_trait]
impl BackendConnection for RmcpConnection {
    async fn request(
        &self,
        method: &str,
        params: Option<JsonObject>,
        timeout: Duration,
    ) -> std::result::Result<Value, CallError> {
        let mut envelope = JsonObject::new();
        envelope.insert("method".to_string(), Value::String(method.to_string()));
        if let Some(params) = params {
            envelope.insert("params".to_string(), Value::Object(params));
        }
        let request: ClientRequest = serde_json::from_value(Value::Object(envelope))
            .map_err(|e| CallError::Other(format!("unsupported request '{method}': {e}")))?;

        let handle = self
            .peer
            .send_cancellable_request(
                request,
                PeerRequestOptions {
                    timeout: Some(timeout),
                    meta: None,
                },
            )
            .await
            .map_err(|e| call_error(e, timeout))?;

        let result = handle
            .await_response()
            .await
            .map_err(|e| call_error(e, timeout))?;

        serde_json::to_value(result)
            .map_err(|e| CallError::Other(format!("unserializable result for '{method}': {e}")))
    }

    async fn close(&self) {
        let client = self.client.lock().await.take();
        if let Some(client) = client
            && let Err(e) = client.cancel().await
        {
            tracing::warn!("Failed to gracefully stop '{}': {}", self.backend_id, e);
        }
    }
}
