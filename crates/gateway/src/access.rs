//! Endpoint resolution and credential verification.
//!
//! Both are seams: the HTTP layer only talks to the traits. `StaticAccess` is the config-backed
//! implementation used by the binary.

use crate::config::EndpointConfig;
use crate::error::{GatewayError, Result};
use axum::http::HeaderMap;
use std::collections::HashMap;

pub const X_API_KEY: &str = "x-api-key";

/// Maps an endpoint name to the namespace it serves.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, endpoint: &str) -> Result<String>;
}

/// Who a request was authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Endpoint has no credentials configured.
    Anonymous,
    /// Matched the endpoint's key at this index.
    ApiKey(usize),
}

/// Checks request credentials for an endpoint. Implementations never expose what they matched.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, endpoint: &str, headers: &HeaderMap) -> Result<Identity>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticAccess {
    endpoints: HashMap<String, EndpointConfig>,
}

impl StaticAccess {
    pub fn new(endpoints: HashMap<String, EndpointConfig>) -> Self {
        Self { endpoints }
    }

    fn endpoint(&self, endpoint: &str) -> Result<&EndpointConfig> {
        self.endpoints
            .get(endpoint)
            .ok_or_else(|| GatewayError::EndpointNotFound(endpoint.to_string()))
    }
}

impl EndpointResolver for StaticAccess {
    fn resolve(&self, endpoint: &str) -> Result<String> {
        Ok(self.endpoint(endpoint)?.namespace.clone())
    }
}

impl CredentialVerifier for StaticAccess {
    fn verify(&self, endpoint: &str, headers: &HeaderMap) -> Result<Identity> {
        let cfg = self.endpoint(endpoint)?;
        if cfg.api_keys.is_empty() {
            return Ok(Identity::Anonymous);
        }

        let presented = presented_key(headers, cfg.accept_x_api_key)?;
        cfg.api_keys
            .iter()
            .position(|k| constant_time_eq(k.as_bytes(), presented.as_bytes()))
            .map(Identity::ApiKey)
            .ok_or_else(|| GatewayError::Unauthorized("invalid credentials".to_string()))
    }
}

fn presented_key(headers: &HeaderMap, accept_x_api_key: bool) -> Result<String> {
    if let Some(authz) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        let Some(token) = authz.strip_prefix("Bearer ").map(str::trim) else {
            return Err(GatewayError::Unauthorized(
                "invalid Authorization header".to_string(),
            ));
        };
        return Ok(token.to_string());
    }
    if accept_x_api_key
        && let Some(key) = headers.get(X_API_KEY).and_then(|h| h.to_str().ok())
    {
        return Ok(key.trim().to_string());
    }
    Err(GatewayError::Unauthorized(
        "missing Authorization header".to_string(),
    ))
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
