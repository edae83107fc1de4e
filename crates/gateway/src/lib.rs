//! Namespace gateway for MCP servers.
//!
//! A client talks to one endpoint; behind it, a per-session aggregator fans calls out to every
//! backend server of the endpoint's namespace. Pre-warmed aggregators come from an idle pool.

pub mod access;
pub mod aggregator;
pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod jsonrpc;
pub mod pool;
pub mod rmcp_backend;
pub mod session;
pub mod transport;

pub use error::{GatewayError, Result};
