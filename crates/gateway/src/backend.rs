//! Backend Server Handle.
//!
//! A handle owns one live connection to a configured backend (child process or remote MCP
//! server) plus the capability lists discovered when it connected. Handles are created by an
//! [`Aggregator`](crate::aggregator::Aggregator) and never shared with another aggregator.
//!
//! The actual transport lives behind [`BackendConnector`] / [`BackendConnection`] so the
//! aggregator, pool and registry can be exercised without spawning processes.

use crate::config::BackendDescriptor;
use crate::error::{GatewayError, Result};
use crate::jsonrpc::JsonObject;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rmcp::model::ErrorData;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Server-initiated messages (JSON-RPC notifications) emitted by backends, in emission order.
pub type NotificationSink = mpsc::Sender<Value>;

/// Notifications buffered per aggregator while no push stream drains them.
pub const PUSH_QUEUE_CAPACITY: usize = 1024;

/// Queue a backend notification without waiting. Returns `false` when it was dropped.
pub fn push_notification(sink: &NotificationSink, backend_id: &str, message: Value) -> bool {
    match sink.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(
                backend = %backend_id,
                capacity = sink.max_capacity(),
                "push queue full; dropping backend notification"
            );
            false
        }
        // The aggregator shut down; nothing left to deliver to.
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// State of a backend server handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// Connecting and discovering capabilities
    Starting,
    /// Connected and routable
    Ready,
    /// Failed to start, or disconnected mid-session
    Failed,
    /// Released by its aggregator (terminal)
    Closed,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Starting => write!(f, "starting"),
            BackendState::Ready => write!(f, "ready"),
            BackendState::Failed => write!(f, "failed"),
            BackendState::Closed => write!(f, "closed"),
        }
    }
}

/// Capability lists advertised by a backend, kept as opaque JSON objects.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredCapabilities {
    pub tools: Vec<JsonObject>,
    pub resources: Vec<JsonObject>,
    pub resource_templates: Vec<JsonObject>,
    pub prompts: Vec<JsonObject>,
}

/// Failure of a single forwarded call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The backend answered with a JSON-RPC error.
    #[error("{}", .0.message)]
    Rpc(ErrorData),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("{0}")]
    Other(String),
}

/// A live connection to one backend.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Send one request and wait for its reply (bounded by `timeout`).
    async fn request(
        &self,
        method: &str,
        params: Option<JsonObject>,
        timeout: Duration,
    ) -> std::result::Result<Value, CallError>;

    /// Release the connection (stop the process / drop the remote session).
    async fn close(&self);
}

/// Result of a successful connect + discovery.
pub struct Connected {
    pub connection: Arc<dyn BackendConnection>,
    pub capabilities: DiscoveredCapabilities,
}

/// Opens backend connections from descriptors.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Connect to the backend and discover its capabilities.
    ///
    /// Notifications emitted by the backend for the lifetime of the connection must be pushed
    /// into `notifications`.
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        notifications: NotificationSink,
    ) -> Result<Connected>;
}

/// Status information for a backend handle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub id: String,
    pub handle_id: u64,
    #[serde(rename = "type")]
    pub transport: String,
    pub state: BackendState,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct BackendHandle {
    handle_id: u64,
    backend_id: String,
    transport: String,
    state: RwLock<BackendState>,
    connection: Mutex<Option<Arc<dyn BackendConnection>>>,
    capabilities: RwLock<DiscoveredCapabilities>,
    last_error: RwLock<Option<String>>,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("handle_id", &self.handle_id)
            .field("backend_id", &self.backend_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl BackendHandle {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            backend_id: descriptor.id.clone(),
            transport: descriptor.transport.to_string(),
            state: RwLock::new(BackendState::Starting),
            connection: Mutex::new(None),
            capabilities: RwLock::new(DiscoveredCapabilities::default()),
            last_error: RwLock::new(None),
        }
    }

    /// Connect and discover, bounded by `startup_timeout`.
    ///
    /// On failure the handle is left in [`BackendState::Failed`] and the error is returned for
    /// diagnostics; the caller decides whether that is fatal.
    pub async fn start(
        &self,
        connector: &dyn BackendConnector,
        descriptor: &BackendDescriptor,
        notifications: NotificationSink,
        startup_timeout: Duration,
    ) -> Result<()> {
        tracing::info!(backend = %self.backend_id, transport = %self.transport, "Starting backend");
        let started = Instant::now();

        let connected = match timeout(startup_timeout, connector.connect(descriptor, notifications))
            .await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                self.record_failure(e.to_string());
                return Err(e);
            }
            Err(_) => {
                let e = GatewayError::StartupTimeout(startup_timeout);
                self.record_failure(format!(
                    "Startup timeout after {}ms for '{}'",
                    startup_timeout.as_millis(),
                    self.backend_id
                ));
                return Err(e);
            }
        };

        tracing::info!(
            backend = %self.backend_id,
            tools = connected.capabilities.tools.len(),
            resources = connected.capabilities.resources.len(),
            prompts = connected.capabilities.prompts.len(),
            elapsed = ?started.elapsed(),
            "Backend connected"
        );
        *self.capabilities.write() = connected.capabilities;
        *self.connection.lock() = Some(connected.connection);

        let closed_while_starting = {
            let mut state = self.state.write();
            if *state == BackendState::Closed {
                true
            } else {
                *state = BackendState::Ready;
                false
            }
        };
        if closed_while_starting {
            let connection = self.connection.lock().take();
            if let Some(connection) = connection {
                connection.close().await;
            }
            return Err(GatewayError::backend(format!(
                "backend '{}' was closed during startup",
                self.backend_id
            )));
        }
        Ok(())
    }

    fn record_failure(&self, reason: String) {
        tracing::warn!(backend = %self.backend_id, error = %reason, "Backend failed to start");
        {
            let mut state = self.state.write();
            if *state != BackendState::Closed {
                *state = BackendState::Failed;
            }
        }
        *self.last_error.write() = Some(reason);
    }

    pub fn id(&self) -> &str {
        &self.backend_id
    }

    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn state(&self) -> BackendState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BackendState::Ready
    }

    pub fn capabilities(&self) -> DiscoveredCapabilities {
        self.capabilities.read().clone()
    }

    pub fn status(&self) -> BackendStatus {
        let caps = self.capabilities.read();
        BackendStatus {
            id: self.backend_id.clone(),
            handle_id: self.handle_id,
            transport: self.transport.clone(),
            state: self.state(),
            tool_count: caps.tools.len(),
            resource_count: caps.resources.len(),
            prompt_count: caps.prompts.len(),
            last_error: self.last_error.read().clone(),
        }
    }

    /// Forward one request to this backend.
    ///
    /// A disconnect marks this handle failed; sibling handles are untouched.
    pub async fn request(
        &self,
        method: &str,
        params: Option<JsonObject>,
        call_timeout: Duration,
    ) -> Result<Value> {
        let state = self.state();
        if state != BackendState::Ready {
            return Err(GatewayError::backend(format!(
                "backend '{}' is {state}",
                self.backend_id
            )));
        }
        let Some(connection) = self.connection.lock().clone() else {
            return Err(GatewayError::backend(format!(
                "backend '{}' has no connection",
                self.backend_id
            )));
        };

        match connection.request(method, params, call_timeout).await {
            Ok(v) => Ok(v),
            Err(CallError::Rpc(error)) => Err(GatewayError::BackendError {
                message: format!("backend '{}': {}", self.backend_id, error.message),
                rpc: Some(error),
            }),
            Err(CallError::Disconnected(reason)) => {
                self.mark_failed(&reason).await;
                Err(GatewayError::backend(format!(
                    "backend '{}' disconnected: {reason}",
                    self.backend_id
                )))
            }
            Err(e) => Err(GatewayError::backend(format!(
                "backend '{}' {method} failed: {e}",
                self.backend_id
            ))),
        }
    }

    async fn mark_failed(&self, reason: &str) {
        {
            let mut state = self.state.write();
            if *state != BackendState::Ready {
                return;
            }
            *state = BackendState::Failed;
        }
        tracing::warn!(backend = %self.backend_id, "Marking backend as failed: {}", reason);
        *self.last_error.write() = Some(reason.to_string());

        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    /// Release this handle. Returns `false` when it was already closed.
    pub async fn close(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.write(), BackendState::Closed);
        if previous == BackendState::Closed {
            return false;
        }

        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            tracing::debug!(backend = %self.backend_id, handle_id = self.handle_id, "Closing backend");
            connection.close().await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendTransport;
    use std::sync::atomic::AtomicUsize;

    struct CountingConnection {
        closes: Arc<AtomicUsize>,
        fail_with: Option<CallError>,
    }

    #[async_trait]
    impl BackendConnection for CountingConnection {
        async fn request(
            &self,
            method: &str,
            _params: Option<JsonObject>,
            _timeout: Duration,
        ) -> std::result::Result<Value, CallError> {
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(serde_json::json!({ "echo": method })),
            }
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct OneShotConnector {
        closes: Arc<AtomicUsize>,
        fail_with: Option<CallError>,
        delay: Duration,
    }

    #[async_trait]
    impl BackendConnector for OneShotConnector {
        async fn connect(
            &self,
            _descriptor: &BackendDescriptor,
            _notifications: NotificationSink,
        ) -> Result<Connected> {
            tokio::time::sleep(self.delay).await;
            Ok(Connected {
                connection: Arc::new(CountingConnection {
                    closes: self.closes.clone(),
                    fail_with: self.fail_with.clone(),
                }),
                capabilities: DiscoveredCapabilities::default(),
            })
        }
    }

    fn descriptor(id: &str) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            transport: BackendTransport::Http {
                url: "http://127.0.0.1:1/mcp".to_string(),
                headers: Default::default(),
            },
        }
    }

    fn connector(fail_with: Option<CallError>, delay: Duration) -> (OneShotConnector, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            OneShotConnector {
                closes: closes.clone(),
                fail_with,
                delay,
            },
            closes,
        )
    }

    #[test]
    fn full_push_queue_drops_instead_of_growing() {
        let (tx, mut rx) = mpsc::channel(2);
        for i in 0..5 {
            push_notification(&tx, "b1", serde_json::json!({ "seq": i }));
        }
        assert_eq!(rx.try_recv().ok(), Some(serde_json::json!({ "seq": 0 })));
        assert_eq!(rx.try_recv().ok(), Some(serde_json::json!({ "seq": 1 })));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!push_notification(&tx, "b1", serde_json::json!({})));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (connector, closes) = connector(None, Duration::ZERO);
        let (tx, _rx) = mpsc::channel(PUSH_QUEUE_CAPACITY);
        let desc = descriptor("b1");
        let handle = BackendHandle::new(&desc);
        handle
            .start(&connector, &desc, tx, Duration::from_secs(1))
            .await
            .expect("start");
        assert_eq!(handle.state(), BackendState::Ready);

        assert!(handle.close().await);
        assert!(!handle.close().await);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), BackendState::Closed);
    }

    #[tokio::test]
    async fn startup_timeout_marks_failed() {
        let (connector, _closes) = connector(None, Duration::from_millis(200));
        let (tx, _rx) = mpsc::channel(PUSH_QUEUE_CAPACITY);
        let desc = descriptor("slow");
        let handle = BackendHandle::new(&desc);
        let err = handle
            .start(&connector, &desc, tx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "StartupTimeout");
        assert_eq!(handle.state(), BackendState::Failed);
        assert!(handle.status().last_error.is_some());
    }

    #[tokio::test]
    async fn disconnect_marks_only_this_handle_failed() {
        let (connector, closes) = connector(
            Some(CallError::Disconnected("pipe closed".into())),
            Duration::ZERO,
        );
        let (tx, _rx) = mpsc::channel(PUSH_QUEUE_CAPACITY);
        let desc = descriptor("b1");
        let handle = BackendHandle::new(&desc);
        handle
            .start(&connector, &desc, tx, Duration::from_secs(1))
            .await
            .expect("start");

        let err = handle
            .request("tools/call", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BackendError");
        assert_eq!(handle.state(), BackendState::Failed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Closing a failed handle does not close the connection twice.
        assert!(handle.close().await);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rpc_errors_are_kept_for_relay() {
        let upstream = ErrorData::new(rmcp::model::ErrorCode(-32001), "nope", None);
        let (connector, _closes) = connector(Some(CallError::Rpc(upstream.clone())), Duration::ZERO);
        let (tx, _rx) = mpsc::channel(PUSH_QUEUE_CAPACITY);
        let desc = descriptor("b1");
        let handle = BackendHandle::new(&desc);
        handle
            .start(&connector, &desc, tx, Duration::from_secs(1))
            .await
            .expect("start");

        let err = handle
            .request("tools/call", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_error(), upstream);
        assert_eq!(handle.state(), BackendState::Ready);
    }
}
