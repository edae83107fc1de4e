//! Session registry.
//!
//! The registry is the single owner of session entries. Every mutation goes through its write
//! lock; the aggregator behind a session is only released after its entry is gone, so a lookup
//! never hands out a transport that is being torn down by someone else.

use crate::error::{GatewayError, Result};
use crate::pool::IdlePool;
use crate::transport::{Transport, TransportState};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Session {
    id: String,
    endpoint: String,
    namespace_id: String,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    /// Dispatches in progress.
    calls: AtomicUsize,
    /// Open push streams.
    streams: AtomicUsize,
    transport: Transport,
}

#[derive(Debug, Clone, Copy)]
enum Activity {
    Call,
    Stream,
}

/// Keeps a session off the idle reaper's list while held. Dropping it counts as activity.
pub struct ActivityGuard {
    session: Arc<Session>,
    kind: Activity,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.session.counter(self.kind).fetch_sub(1, Ordering::AcqRel);
        self.session.touch();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("namespace_id", &self.namespace_id)
            .field("state", &self.transport.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn counter(&self, kind: Activity) -> &AtomicUsize {
        match kind {
            Activity::Call => &self.calls,
            Activity::Stream => &self.streams,
        }
    }

    fn begin(self: &Arc<Self>, kind: Activity) -> ActivityGuard {
        self.touch();
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
        ActivityGuard {
            session: Arc::clone(self),
            kind,
        }
    }

    /// Mark a client message as being dispatched until the guard drops.
    pub fn begin_call(self: &Arc<Self>) -> ActivityGuard {
        self.begin(Activity::Call)
    }

    /// Mark the push stream as open until the guard drops.
    pub fn begin_stream(self: &Arc<Self>) -> ActivityGuard {
        self.begin(Activity::Stream)
    }

    /// A call is in progress or a push stream is attached.
    pub fn is_busy(&self) -> bool {
        self.calls.load(Ordering::Acquire) > 0 || self.streams.load(Ordering::Acquire) > 0
    }

    pub fn info(&self) -> SessionInfo {
        let aggregator = self.transport.aggregator();
        let idle = self.idle_for();
        SessionInfo {
            session_id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            namespace: self.namespace_id.clone(),
            created_at: self.created_at,
            last_activity_at: Utc::now() - chrono::TimeDelta::from_std(idle).unwrap_or_default(),
            idle_secs: idle.as_secs(),
            state: self.transport.state(),
            live_backends: aggregator.live_backends(),
            backends: aggregator.backend_status(),
        }
    }
}

/// Read-only view of a live session for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub endpoint: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub state: TransportState,
    pub live_backends: usize,
    pub backends: Vec<crate::backend::BackendStatus>,
}

pub struct SessionRegistry {
    pool: Arc<IdlePool>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    idle_timeout: Option<Duration>,
}

impl SessionRegistry {
    pub fn new(pool: Arc<IdlePool>, idle_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        })
    }

    pub fn pool(&self) -> &Arc<IdlePool> {
        &self.pool
    }

    /// Obtain an aggregator for `namespace_id`, bind a transport to it under a fresh id and
    /// store the entry.
    pub async fn create(&self, endpoint: &str, namespace_id: &str) -> Result<Arc<Session>> {
        let aggregator = self.pool.acquire(namespace_id).await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let transport = Transport::new(session_id.clone(), aggregator);
        if !transport.activate() {
            return Err(GatewayError::Internal(format!(
                "fresh transport for session '{session_id}' could not be activated"
            )));
        }
        let session = Arc::new(Session {
            id: session_id.clone(),
            endpoint: endpoint.to_string(),
            namespace_id: namespace_id.to_string(),
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            calls: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
            transport,
        });

        let collided = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&session_id) {
                true
            } else {
                sessions.insert(session_id.clone(), Arc::clone(&session));
                false
            }
        };
        if collided {
            session.transport.close().await;
            return Err(GatewayError::Internal(format!(
                "session id collision for '{session_id}'"
            )));
        }

        tracing::info!(
            session_id = %session_id,
            endpoint = %endpoint,
            namespace = %namespace_id,
            instance_id = session.transport.aggregator().instance_id(),
            "Session created"
        );
        Ok(session)
    }

    /// Pure read; never creates.
    pub fn lookup(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }

    /// Remove the entry and tear it down. Returns `false` when the id was not registered.
    pub async fn terminate(&self, session_id: &str) -> Result<bool> {
        let removed = self.sessions.write().remove(session_id);
        let Some(session) = removed else {
            tracing::debug!(session_id = %session_id, "terminate: session already gone");
            return Ok(false);
        };

        session.transport.close().await;
        tracing::info!(
            session_id = %session_id,
            namespace = %session.namespace_id,
            "Session terminated"
        );
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Live sessions, optionally filtered by namespace, oldest first.
    pub fn list(&self, namespace_id: Option<&str>) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .values()
            .filter(|s| namespace_id.is_none_or(|ns| s.namespace_id == ns))
            .map(|s| s.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.session_id.cmp(&b.session_id)));
        infos
    }

    /// Terminate sessions idle for longer than the configured timeout. Sessions with a call in
    /// progress or an open push stream are never idle.
    pub async fn reap_idle(&self) -> usize {
        let Some(idle_timeout) = self.idle_timeout else {
            return 0;
        };
        let expired: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| !s.is_busy() && s.idle_for() >= idle_timeout)
            .map(|s| s.id.clone())
            .collect();

        let mut reaped = 0;
        for session_id in expired {
            tracing::info!(session_id = %session_id, "Session idle timeout");
            if let Ok(true) = self.terminate(&session_id).await {
                reaped += 1;
            }
        }
        reaped
    }

    pub fn spawn_idle_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        self.idle_timeout?;
        let registry = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                let reaped = registry.reap_idle().await;
                if reaped > 0 {
                    tracing::debug!(reaped, "Reaped idle sessions");
                }
            }
        }))
    }

    /// Terminate every live session.
    pub async fn shutdown_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        let mut closed = 0;
        for session_id in ids {
            if let Ok(true) = self.terminate(&session_id).await {
                closed += 1;
            }
        }
        tracing::info!(closed, "All sessions terminated");
        closed
    }
}
