//! JSON-RPC envelope handling.
//!
//! Only envelope fields are inspected here (`id`, `method`, `params`). Payloads stay opaque
//! `serde_json` values and are forwarded verbatim.

use crate::error::{GatewayError, Result};
use rmcp::model::{ErrorData, RequestId};
use serde_json::{Value, json};

pub type JsonObject = serde_json::Map<String, Value>;

pub const JSONRPC_VERSION: &str = "2.0";

/// A message posted by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<JsonObject>,
    },
    Notification {
        method: String,
        params: Option<JsonObject>,
    },
    /// Reply to a server-initiated request. Accepted and dropped: the gateway never issues
    /// requests to clients.
    Response { id: RequestId },
}

impl ClientMessage {
    pub fn method(&self) -> Option<&str> {
        match self {
            ClientMessage::Request { method, .. } | ClientMessage::Notification { method, .. } => {
                Some(method)
            }
            ClientMessage::Response { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, ClientMessage::Request { .. })
    }
}

/// Parse one client JSON-RPC message (batches are not supported).
pub fn parse_client_message(value: Value) -> Result<ClientMessage> {
    let Value::Object(mut obj) = value else {
        return Err(GatewayError::BadRequest(
            "expected a single JSON-RPC object".to_string(),
        ));
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(GatewayError::BadRequest(
            "missing or unsupported jsonrpc version".to_string(),
        ));
    }

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(serde_json::from_value::<RequestId>(raw).map_err(|e| {
            GatewayError::BadRequest(format!("invalid JSON-RPC id: {e}"))
        })?),
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => None,
        Some(Value::Object(p)) => Some(p),
        Some(_) => {
            return Err(GatewayError::BadRequest(
                "params must be an object".to_string(),
            ));
        }
    };

    match (obj.remove("method"), id) {
        (Some(Value::String(method)), Some(id)) => Ok(ClientMessage::Request { id, method, params }),
        (Some(Value::String(method)), None) => Ok(ClientMessage::Notification { method, params }),
        (Some(_), _) => Err(GatewayError::BadRequest(
            "method must be a string".to_string(),
        )),
        (None, Some(id)) if obj.contains_key("result") || obj.contains_key("error") => {
            Ok(ClientMessage::Response { id })
        }
        (None, _) => Err(GatewayError::BadRequest(
            "message is neither a request, a notification nor a response".to_string(),
        )),
    }
}

pub fn response(id: &RequestId, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

pub fn error_response(id: &RequestId, error: &ErrorData) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error })
}

pub fn notification(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => json!({ "jsonrpc": JSONRPC_VERSION, "method": method, "params": params }),
        None => json!({ "jsonrpc": JSONRPC_VERSION, "method": method }),
    }
}
