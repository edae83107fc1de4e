//! Gateway error taxonomy.
//!
//! Every externally reachable failure is one of these variants. HTTP handlers render them as a
//! status code plus a structured JSON body; in-session routing failures are rendered as JSON-RPC
//! error objects instead (see [`GatewayError::to_rpc_error`]).

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use rmcp::model::{ErrorCode, ErrorData};
use serde::Serialize;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Endpoint name did not resolve to a namespace.
    #[error("endpoint '{0}' not found")]
    EndpointNotFound(String),

    /// Credential verification rejected the request.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No backend in the namespace became ready.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Unknown tool/resource/prompt name.
    #[error("capability '{0}' not found")]
    CapabilityNotFound(String),

    /// A reachable backend failed the call (error reply, disconnect, timeout, cancellation).
    #[error("backend error: {message}")]
    BackendError {
        message: String,
        /// Backend JSON-RPC error relayed verbatim, when the backend produced one.
        rpc: Option<ErrorData>,
    },

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// Cold build of an aggregator exceeded the startup bound.
    #[error("startup timeout after {}ms", .0.as_millis())]
    StartupTimeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendError {
            message: message.into(),
            rpc: None,
        }
    }

    /// Stable error kind name surfaced to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EndpointNotFound(_) => "EndpointNotFound",
            Self::Unauthorized(_) => "Unauthorized",
            Self::BackendUnavailable(_) => "BackendUnavailable",
            Self::CapabilityNotFound(_) => "CapabilityNotFound",
            Self::BackendError { .. } => "BackendError",
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::StartupTimeout(_) => "StartupTimeout",
            Self::Config(_) => "Config",
            Self::BadRequest(_) => "BadRequest",
            Self::Conflict(_) => "Conflict",
            Self::Internal(_) => "Internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EndpointNotFound(_) | Self::SessionNotFound(_) | Self::CapabilityNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BackendUnavailable(_) | Self::BackendError { .. } => StatusCode::BAD_GATEWAY,
            Self::StartupTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error object for a failure that happened while routing an in-session request.
    pub fn to_rpc_error(&self) -> ErrorData {
        let data = Some(serde_json::json!({ "kind": self.kind() }));
        match self {
            Self::BackendError { rpc: Some(rpc), .. } => rpc.clone(),
            Self::CapabilityNotFound(_) | Self::BadRequest(_) => {
                ErrorData::new(ErrorCode::INVALID_PARAMS, self.to_string(), data)
            }
            _ => ErrorData::new(ErrorCode::INTERNAL_ERROR, self.to_string(), data),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    timestamp: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
