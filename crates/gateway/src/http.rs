//! HTTP surface: the session transport routes, health, and the admin read routes.

use crate::access::{CredentialVerifier, EndpointResolver, constant_time_eq};
use crate::error::{GatewayError, Result};
use crate::jsonrpc::{self, ClientMessage};
use crate::pool::PoolSnapshot;
use crate::session::{Session, SessionRegistry};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{MethodRouter, get},
};
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
const JSON_MIME_TYPE: &str = "application/json";

/// Cap on a single POSTed JSON-RPC message.
const MAX_POST_BODY_BYTES: usize = 4 * 1024 * 1024;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct GatewayState {
    pub registry: Arc<SessionRegistry>,
    pub resolver: Arc<dyn EndpointResolver>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub sse_keep_alive: Duration,
    pub admin_token: Option<String>,
    pub start_time: Instant,
    /// Cancelled on process shutdown; ends open push streams.
    pub shutdown: CancellationToken,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    let admin = Router::new()
        .route("/admin/sessions", get(admin_sessions))
        .route("/admin/pool", get(admin_pool))
        .route("/admin/status", get(admin_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    Router::new()
        .route("/{endpoint}/session", session_routes())
        .route("/{endpoint}/mcp", session_routes())
        .route("/health", get(health))
        .merge(admin)
        .layer(DefaultBodyLimit::max(MAX_POST_BODY_BYTES))
        .with_state(state)
}

fn session_routes() -> MethodRouter<Arc<GatewayState>> {
    axum::routing::post(post_session)
        .get(get_session)
        .delete(delete_session)
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Resolve the endpoint and check credentials. Runs before any session lookup.
fn admit(state: &GatewayState, endpoint: &str, headers: &HeaderMap) -> Result<String> {
    let namespace_id = state.resolver.resolve(endpoint)?;
    state.verifier.verify(endpoint, headers)?;
    Ok(namespace_id)
}

/// Look up a session and make sure it belongs to `endpoint`. A session of another endpoint is
/// indistinguishable from an unknown one.
fn session_for(state: &GatewayState, endpoint: &str, session_id: &str) -> Result<Arc<Session>> {
    let session = state.registry.lookup(session_id)?;
    if session.endpoint() != endpoint {
        return Err(GatewayError::SessionNotFound(session_id.to_string()));
    }
    Ok(session)
}

async fn post_session(
    Path(endpoint): Path<String>,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, Response> {
    let session_id = session_header(&headers);
    let span = tracing::info_span!(
        "gateway.session.post",
        endpoint = %endpoint,
        has_session = session_id.is_some()
    );

    async move {
        let namespace_id = admit(&state, &endpoint, &headers).map_err(IntoResponse::into_response)?;
        let message = parse_body(&body).map_err(IntoResponse::into_response)?;

        let session = match session_id {
            None => state
                .registry
                .create(&endpoint, &namespace_id)
                .await
                .map_err(IntoResponse::into_response)?,
            Some(id) => session_for(&state, &endpoint, &id).map_err(IntoResponse::into_response)?,
        };
        let dispatching = session.begin_call();

        let reply = session
            .transport()
            .dispatch(message)
            .await
            .map_err(IntoResponse::into_response)?;
        drop(dispatching);

        if session.transport().aggregator().live_backends() == 0 {
            tracing::warn!(
                session_id = %session.id(),
                namespace = %session.namespace_id(),
                "no live backend left; terminating session"
            );
            let _ = state.registry.terminate(session.id()).await;
        }

        let mut resp = match reply {
            None => StatusCode::ACCEPTED.into_response(),
            Some(reply) if accepts_only_event_stream(&headers) => sse_single_message(&reply),
            Some(reply) => Json(reply).into_response(),
        };
        insert_session_header(&mut resp, session.id())?;
        Ok(resp)
    }
    .instrument(span)
    .await
}

fn parse_body(body: &Bytes) -> Result<ClientMessage> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {e}")))?;
    jsonrpc::parse_client_message(value)
}

async fn get_session(
    Path(endpoint): Path<String>,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> std::result::Result<Response, Response> {
    let session_id = session_header(&headers);
    let span = tracing::info_span!(
        "gateway.session.get",
        endpoint = %endpoint,
        has_session = session_id.is_some()
    );

    async move {
        admit(&state, &endpoint, &headers).map_err(IntoResponse::into_response)?;
        let Some(session_id) = session_id else {
            return Err(GatewayError::BadRequest(format!("missing {HEADER_SESSION_ID} header"))
                .into_response());
        };
        let session =
            session_for(&state, &endpoint, &session_id).map_err(IntoResponse::into_response)?;

        let stream = session
            .transport()
            .attach_stream()
            .map_err(IntoResponse::into_response)?;
        tracing::debug!(session_id = %session_id, "push stream attached");

        // Held by the response body; released when the client goes away or the stream ends.
        let streaming = session.begin_stream();
        let events = stream
            .map(move |msg| {
                let _streaming = &streaming;
                Ok::<_, Infallible>(Event::default().data(msg.to_string()))
            })
            .take_until(state.shutdown.clone().cancelled_owned());

        let mut resp = Sse::new(events)
            .keep_alive(KeepAlive::new().interval(state.sse_keep_alive))
            .into_response();
        resp.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
        );
        insert_session_header(&mut resp, &session_id)?;
        Ok(resp)
    }
    .instrument(span)
    .await
}

async fn delete_session(
    Path(endpoint): Path<String>,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> std::result::Result<Response, Response> {
    let session_id = session_header(&headers);
    let span = tracing::info_span!(
        "gateway.session.delete",
        endpoint = %endpoint,
        has_session = session_id.is_some()
    );

    async move {
        admit(&state, &endpoint, &headers).map_err(IntoResponse::into_response)?;
        let Some(session_id) = session_id else {
            return Err(GatewayError::BadRequest(format!("missing {HEADER_SESSION_ID} header"))
                .into_response());
        };

        // Unknown ids (or ids of another endpoint) are a no-op success.
        match session_for(&state, &endpoint, &session_id) {
            Ok(_) => {
                state
                    .registry
                    .terminate(&session_id)
                    .await
                    .map_err(IntoResponse::into_response)?;
            }
            Err(_) => {
                tracing::debug!(session_id = %session_id, "delete of unknown session");
            }
        }
        Ok(StatusCode::OK.into_response())
    }
    .instrument(span)
    .await
}

fn accepts_only_event_stream(headers: &HeaderMap) -> bool {
    let Some(accept) = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|h| h.to_str().ok())
    else {
        return false;
    };
    let json_ok = accept.contains(JSON_MIME_TYPE)
        || accept.contains("application/*")
        || accept.contains("*/*");
    !json_ok && accept.contains(EVENT_STREAM_MIME_TYPE)
}

fn sse_single_message(msg: &Value) -> Response {
    let data = msg.to_string();
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(Event::default().data(data)) });
    let mut resp = Sse::new(stream).into_response();
    resp.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
    );
    resp
}

fn insert_session_header(resp: &mut Response, session_id: &str) -> std::result::Result<(), Response> {
    let value = HeaderValue::from_str(session_id).map_err(|e| {
        GatewayError::Internal(format!("session id is not a valid header value: {e}")).into_response()
    })?;
    resp.headers_mut().insert(HEADER_SESSION_ID, value);
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn admin_auth(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.admin_token.as_deref() {
        let got = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        let wanted = format!("Bearer {expected}");
        if !constant_time_eq(got.as_bytes(), wanted.as_bytes()) {
            return GatewayError::Unauthorized("admin token required".to_string()).into_response();
        }
    }
    next.run(request).await
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    namespace: Option<String>,
}

async fn admin_sessions(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<SessionsQuery>,
) -> Json<Value> {
    let sessions = state.registry.list(query.namespace.as_deref());
    Json(json!({ "sessions": sessions }))
}

async fn admin_pool(State(state): State<Arc<GatewayState>>) -> Json<PoolSnapshot> {
    Json(state.registry.pool().snapshot())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    uptime_secs: u64,
    session_count: usize,
    pool: PoolSnapshot,
}

async fn admin_status(State(state): State<Arc<GatewayState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: VERSION,
        uptime_secs: state.start_time.elapsed().as_secs(),
        session_count: state.registry.len(),
        pool: state.registry.pool().snapshot(),
    })
}
