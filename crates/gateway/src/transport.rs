//! Per-session transport state machine.
//!
//! `uninitialized -> active -> closing -> closed`. Forwarded calls hold the read side of a gate
//! and `close` takes the write side, so teardown waits for in-flight calls to finish (or observe
//! cancellation) before backend handles are released.

use crate::aggregator::Aggregator;
use crate::error::{GatewayError, Result};
use crate::jsonrpc::{self, ClientMessage};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Uninitialized,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Uninitialized => "uninitialized",
            TransportState::Active => "active",
            TransportState::Closing => "closing",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

type PushQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Value>>>;

pub struct Transport {
    session_id: String,
    state: Mutex<TransportState>,
    aggregator: Arc<Aggregator>,
    gate: RwLock<()>,
    cancel: CancellationToken,
    push: PushQueue,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("aggregator", &self.aggregator.instance_id())
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(session_id: String, aggregator: Aggregator) -> Self {
        let push = aggregator.take_notifications().unwrap_or_else(|| {
            // Sender side dropped immediately: the stream ends as soon as it is attached.
            let (_tx, rx) = mpsc::channel(1);
            rx
        });
        Self {
            session_id,
            state: Mutex::new(TransportState::Uninitialized),
            aggregator: Arc::new(aggregator),
            gate: RwLock::new(()),
            cancel: CancellationToken::new(),
            push: Arc::new(tokio::sync::Mutex::new(push)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// `uninitialized -> active`. Returns `false` from any other state.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TransportState::Uninitialized {
            return false;
        }
        *state = TransportState::Active;
        true
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            TransportState::Active => Ok(()),
            TransportState::Uninitialized => Err(GatewayError::Conflict(format!(
                "session '{}' is not initialized yet",
                self.session_id
            ))),
            TransportState::Closing | TransportState::Closed => {
                Err(GatewayError::SessionNotFound(self.session_id.clone()))
            }
        }
    }

    /// Deliver one client message. Requests yield their correlated JSON-RPC reply; notifications
    /// and responses yield `None`.
    pub async fn dispatch(&self, message: ClientMessage) -> Result<Option<Value>> {
        self.ensure_active()?;
        let _in_flight = self.gate.read().await;
        // `close` may have run while we waited on the gate.
        self.ensure_active()?;

        match message {
            ClientMessage::Request { id, method, params } => {
                let reply = match self
                    .aggregator
                    .handle_request(&id, &method, params, &self.cancel)
                    .await
                {
                    Ok(result) => jsonrpc::response(&id, result),
                    Err(error) => jsonrpc::error_response(&id, &error),
                };
                Ok(Some(reply))
            }
            ClientMessage::Notification { method, params } => {
                self.aggregator.handle_notification(&method, params.as_ref());
                Ok(None)
            }
            ClientMessage::Response { id } => {
                tracing::debug!(session_id = %self.session_id, id = ?id, "dropping client response");
                Ok(None)
            }
        }
    }

    /// Attach the server-push stream. Only one stream may be attached at a time; the stream ends
    /// when the transport closes or every backend is gone.
    pub fn attach_stream(&self) -> Result<impl Stream<Item = Value> + Send + use<>> {
        self.ensure_active()?;
        let guard = Arc::clone(&self.push).try_lock_owned().map_err(|_| {
            GatewayError::Conflict(format!(
                "session '{}' already has an open stream",
                self.session_id
            ))
        })?;
        let cancel = self.cancel.clone();

        Ok(futures::stream::unfold(
            (guard, cancel),
            |(mut guard, cancel)| async move {
                let next = tokio::select! {
                    () = cancel.cancelled() => None,
                    msg = guard.recv() => msg,
                };
                next.map(|msg| (msg, (guard, cancel)))
            },
        ))
    }

    /// Begin and complete teardown. Returns `false` if another caller already closed it.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                TransportState::Closing | TransportState::Closed => return false,
                TransportState::Uninitialized | TransportState::Active => {
                    *state = TransportState::Closing;
                }
            }
        }
        tracing::debug!(session_id = %self.session_id, "transport closing");

        self.cancel.cancel();
        let _exclusive = self.gate.write().await;
        self.aggregator.shutdown().await;

        *self.state.lock() = TransportState::Closed;
        tracing::debug!(session_id = %self.session_id, "transport closed");
        true
    }
}
