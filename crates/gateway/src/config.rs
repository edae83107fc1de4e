//! Configuration parsing and validation.
//!
//! Precedence: built-in defaults < config file < environment < CLI flags. Environment and CLI
//! are folded together by clap (`env = ...` on every flag).

use crate::aggregator::QUALIFIED_SEPARATOR;
use crate::error::{GatewayError, Result};
use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// CLI Arguments
// ============================================================================

/// CLI arguments for the gateway.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "unrelated-namespace-gateway")]
#[command(
    version,
    about = "Aggregate a namespace of MCP servers behind one streamable HTTP endpoint"
)]
pub struct CliArgs {
    /// Path to the YAML (or `.json`) config file.
    #[arg(short = 'c', long = "config", env = "UNRELATED_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the fully resolved configuration (after env expansion + overrides) and exit.
    #[arg(long = "print-effective-config")]
    pub print_effective_config: bool,

    /// HTTP bind address (ip:port)
    #[arg(short = 'b', long, env = "UNRELATED_GATEWAY_BIND")]
    pub bind: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "UNRELATED_GATEWAY_LOG")]
    pub log_level: Option<String>,

    /// Max time to wait for a namespace's backends to become ready (seconds)
    #[arg(long, env = "UNRELATED_GATEWAY_STARTUP_TIMEOUT")]
    pub startup_timeout: Option<u64>,

    /// Timeout for individual forwarded calls (seconds)
    #[arg(long, env = "UNRELATED_GATEWAY_CALL_TIMEOUT")]
    pub call_timeout: Option<u64>,

    /// Pre-warmed aggregator instances kept per namespace (0 disables the pool).
    #[arg(long, env = "UNRELATED_GATEWAY_POOL_DEPTH")]
    pub pool_depth: Option<usize>,

    /// Discard pooled instances older than this (seconds).
    #[arg(long, env = "UNRELATED_GATEWAY_POOL_MAX_IDLE_AGE")]
    pub pool_max_idle_age: Option<u64>,

    /// Terminate sessions without activity for this long (seconds, 0 disables).
    #[arg(long, env = "UNRELATED_GATEWAY_SESSION_IDLE_TIMEOUT")]
    pub session_idle_timeout: Option<u64>,

    /// Bearer token required for `/admin/*` routes.
    #[arg(long = "admin-token", env = "UNRELATED_GATEWAY_ADMIN_TOKEN")]
    pub admin_token: Option<String>,
}

// ============================================================================
// Effective settings
// ============================================================================

const DEFAULT_BIND: &str = "127.0.0.1:12009";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 30;
const DEFAULT_SSE_KEEP_ALIVE_SECS: u64 = 15;
const DEFAULT_POOL_DEPTH: usize = 1;
const DEFAULT_POOL_MAX_IDLE_AGE_SECS: u64 = 600;
const DEFAULT_POOL_BACKOFF_MIN_MS: u64 = 250;
const DEFAULT_POOL_BACKOFF_MAX_MS: u64 = 30000;
const DEFAULT_POOL_WARMUP_DELAY_MS: u64 = 3000;
const DEFAULT_POOL_EVICTION_INTERVAL_SECS: u64 = 30;

/// Effective gateway settings (after merging defaults + config + env + CLI).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySettings {
    pub bind: String,
    pub log_level: String,
    pub startup_timeout: u64,
    pub call_timeout: u64,
    /// `0` disables the idle reaper.
    pub session_idle_timeout: u64,
    pub reaper_interval: u64,
    pub sse_keep_alive: u64,
    #[serde(skip_serializing)]
    pub admin_token: Option<String>,
    pub pool: PoolSettings,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSettings {
    pub depth: usize,
    pub max_idle_age: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub warmup_delay_ms: u64,
    pub eviction_interval: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT_SECS,
            call_timeout: DEFAULT_CALL_TIMEOUT_SECS,
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
            reaper_interval: DEFAULT_REAPER_INTERVAL_SECS,
            sse_keep_alive: DEFAULT_SSE_KEEP_ALIVE_SECS,
            admin_token: None,
            pool: PoolSettings::default(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            depth: DEFAULT_POOL_DEPTH,
            max_idle_age: DEFAULT_POOL_MAX_IDLE_AGE_SECS,
            backoff_min_ms: DEFAULT_POOL_BACKOFF_MIN_MS,
            backoff_max_ms: DEFAULT_POOL_BACKOFF_MAX_MS,
            warmup_delay_ms: DEFAULT_POOL_WARMUP_DELAY_MS,
            eviction_interval: DEFAULT_POOL_EVICTION_INTERVAL_SECS,
        }
    }
}

impl GatewaySettings {
    pub fn startup_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    pub fn call_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }

    pub fn session_idle_timeout_duration(&self) -> Option<Duration> {
        (self.session_idle_timeout > 0).then(|| Duration::from_secs(self.session_idle_timeout))
    }

    pub fn reaper_interval_duration(&self) -> Duration {
        Duration::from_secs(self.reaper_interval.max(1))
    }

    pub fn sse_keep_alive_duration(&self) -> Duration {
        Duration::from_secs(self.sse_keep_alive.max(1))
    }
}

impl PoolSettings {
    pub fn max_idle_age_duration(&self) -> Duration {
        Duration::from_secs(self.max_idle_age)
    }

    pub fn backoff_min_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn warmup_delay_duration(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }

    pub fn eviction_interval_duration(&self) -> Duration {
        Duration::from_secs(self.eviction_interval.max(1))
    }
}

// ============================================================================
// Config file
// ============================================================================

/// Gateway settings as provided by the config file (partial; all fields optional).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySection {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub startup_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub call_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub session_idle_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub reaper_interval: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub sse_keep_alive: Option<u64>,
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub pool: PoolSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PoolSection {
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub depth: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub max_idle_age: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub backoff_min_ms: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub backoff_max_ms: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub warmup_delay_ms: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub eviction_interval: Option<u64>,
}

/// A named group of backend servers. Descriptor order decides alias collisions.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceConfig {
    #[serde(default)]
    pub servers: Vec<BackendDescriptor>,
}

/// How to reach one backend, plus the stable id that qualifies its capability names.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub id: String,
    #[serde(flatten)]
    pub transport: BackendTransport,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendTransport {
    /// Child process speaking MCP over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote MCP server over streamable HTTP.
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl std::fmt::Display for BackendTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendTransport::Stdio { .. } => write!(f, "stdio"),
            BackendTransport::Http { .. } => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub namespace: String,
    /// Static API keys accepted for this endpoint. Empty means the endpoint is public.
    #[serde(default, skip_serializing)]
    pub api_keys: Vec<String>,
    /// If true, accept `x-api-key: <key>` as an alias for `Authorization: Bearer <key>`.
    #[serde(default = "default_true")]
    pub accept_x_api_key: bool,
}

fn default_true() -> bool {
    true
}

/// Config file format.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub namespaces: HashMap<String, NamespaceConfig>,
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
}

// ============================================================================
// Effective Configuration
// ============================================================================

/// Merged configuration from all sources.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub cli: CliArgs,
    pub gateway: GatewaySettings,
    pub namespaces: HashMap<String, NamespaceConfig>,
    pub endpoints: HashMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub gateway: GatewaySettings,
    pub namespaces: HashMap<String, NamespaceConfig>,
    pub endpoints: HashMap<String, EndpointConfig>,
}

impl GatewayConfig {
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            gateway: self.gateway.clone(),
            namespaces: self.namespaces.clone(),
            endpoints: self.endpoints.clone(),
        }
    }

    /// Load and merge configuration from CLI args, env, and the config file.
    pub fn load(cli: CliArgs) -> Result<Self> {
        let mut gateway = GatewaySettings::default();
        let mut namespaces = HashMap::new();
        let mut endpoints = HashMap::new();

        // 1) Config file (if provided).
        if let Some(path) = &cli.config {
            let file = load_config_file(path)?;
            apply_gateway_section(&mut gateway, file.gateway)?;
            for (id, ns) in file.namespaces {
                namespaces.insert(id, expand_namespace_env_vars(ns)?);
            }
            for (name, endpoint) in file.endpoints {
                endpoints.insert(name, expand_endpoint_env_vars(endpoint)?);
            }
        }

        // 2) CLI/ENV overrides (CLI > ENV is handled by clap).
        apply_cli_overrides(&mut gateway, &cli)?;

        // 3) Validate.
        validate(&gateway, &namespaces, &endpoints)?;

        Ok(Self {
            cli,
            gateway,
            namespaces,
            endpoints,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn load_config_file(path: &std::path::Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    // YAML by default; JSON when extension is .json
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

fn apply_gateway_section(gateway: &mut GatewaySettings, section: GatewaySection) -> Result<()> {
    if let Some(bind) = section.bind {
        gateway.bind = expand_env_string(&bind)?;
    }
    if let Some(level) = section.log_level {
        gateway.log_level = expand_env_string(&level)?;
    }
    if let Some(v) = section.startup_timeout {
        gateway.startup_timeout = v;
    }
    if let Some(v) = section.call_timeout {
        gateway.call_timeout = v;
    }
    if let Some(v) = section.session_idle_timeout {
        gateway.session_idle_timeout = v;
    }
    if let Some(v) = section.reaper_interval {
        gateway.reaper_interval = v;
    }
    if let Some(v) = section.sse_keep_alive {
        gateway.sse_keep_alive = v;
    }
    if let Some(v) = section.admin_token {
        let t = expand_env_string(&v)?;
        let t = t.trim().to_string();
        gateway.admin_token = (!t.is_empty()).then_some(t);
    }

    let pool = section.pool;
    if let Some(v) = pool.depth {
        gateway.pool.depth = usize::try_from(v)
            .map_err(|_| GatewayError::Config(format!("pool.depth out of range: {v}")))?;
    }
    if let Some(v) = pool.max_idle_age {
        gateway.pool.max_idle_age = v;
    }
    if let Some(v) = pool.backoff_min_ms {
        gateway.pool.backoff_min_ms = v;
    }
    if let Some(v) = pool.backoff_max_ms {
        gateway.pool.backoff_max_ms = v;
    }
    if let Some(v) = pool.warmup_delay_ms {
        gateway.pool.warmup_delay_ms = v;
    }
    if let Some(v) = pool.eviction_interval {
        gateway.pool.eviction_interval = v;
    }
    Ok(())
}

fn apply_cli_overrides(gateway: &mut GatewaySettings, cli: &CliArgs) -> Result<()> {
    if let Some(bind) = &cli.bind {
        gateway.bind = expand_env_string(bind)?;
    }

    // Precedence for log level:
    // CLI flag (--log-level) / UNRELATED_GATEWAY_LOG env (via clap) > RUST_LOG env > config file > defaults
    if let Some(level) = &cli.log_level {
        gateway.log_level.clone_from(level);
    } else if let Ok(level) = std::env::var("RUST_LOG")
        && !level.trim().is_empty()
    {
        gateway.log_level = level;
    }

    if let Some(v) = cli.startup_timeout {
        gateway.startup_timeout = v;
    }
    if let Some(v) = cli.call_timeout {
        gateway.call_timeout = v;
    }
    if let Some(v) = cli.pool_depth {
        gateway.pool.depth = v;
    }
    if let Some(v) = cli.pool_max_idle_age {
        gateway.pool.max_idle_age = v;
    }
    if let Some(v) = cli.session_idle_timeout {
        gateway.session_idle_timeout = v;
    }
    if let Some(v) = &cli.admin_token {
        let t = v.trim().to_string();
        gateway.admin_token = (!t.is_empty()).then_some(t);
    }
    Ok(())
}

fn validate(
    gateway: &GatewaySettings,
    namespaces: &HashMap<String, NamespaceConfig>,
    endpoints: &HashMap<String, EndpointConfig>,
) -> Result<()> {
    if gateway.startup_timeout == 0 {
        return Err(GatewayError::Config("startupTimeout must be > 0".to_string()));
    }
    if gateway.call_timeout == 0 {
        return Err(GatewayError::Config("callTimeout must be > 0".to_string()));
    }
    if gateway.pool.backoff_min_ms > gateway.pool.backoff_max_ms {
        return Err(GatewayError::Config(format!(
            "Invalid pool backoff: backoffMinMs ({}) must be <= backoffMaxMs ({})",
            gateway.pool.backoff_min_ms, gateway.pool.backoff_max_ms
        )));
    }

    for (ns_id, ns) in namespaces {
        let mut seen = HashSet::new();
        for server in &ns.servers {
            if server.id.trim().is_empty() {
                return Err(GatewayError::Config(format!(
                    "namespace '{ns_id}': backend id must not be empty"
                )));
            }
            if server.id.contains(QUALIFIED_SEPARATOR) {
                return Err(GatewayError::Config(format!(
                    "namespace '{ns_id}': backend id '{}' must not contain '{QUALIFIED_SEPARATOR}'",
                    server.id
                )));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "namespace '{ns_id}': duplicate backend id '{}'",
                    server.id
                )));
            }
        }
    }

    for (name, endpoint) in endpoints {
        if !namespaces.contains_key(&endpoint.namespace) {
            return Err(GatewayError::Config(format!(
                "endpoint '{name}' references unknown namespace '{}'",
                endpoint.namespace
            )));
        }
    }
    Ok(())
}

/// Expand ${VAR} patterns in every backend descriptor of a namespace.
fn expand_namespace_env_vars(mut ns: NamespaceConfig) -> Result<NamespaceConfig> {
    for server in &mut ns.servers {
        match &mut server.transport {
            BackendTransport::Stdio { command, args, env } => {
                *command = expand_env_string(command)?;
                for arg in args.iter_mut() {
                    *arg = expand_env_string(arg)?;
                }
                for value in env.values_mut() {
                    *value = expand_env_string(value)?;
                }
            }
            BackendTransport::Http { url, headers } => {
                *url = expand_env_string(url)?;
                for value in headers.values_mut() {
                    *value = expand_env_string(value)?;
                }
            }
        }
    }
    Ok(ns)
}

fn expand_endpoint_env_vars(mut endpoint: EndpointConfig) -> Result<EndpointConfig> {
    endpoint.namespace = expand_env_string(&endpoint.namespace)?;
    endpoint.api_keys = endpoint
        .api_keys
        .iter()
        .map(|k| expand_env_string(k).map(|k| k.trim().to_string()))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter(|k| !k.is_empty())
        .collect();
    Ok(endpoint)
}

/// Expand ${VAR} patterns in a string.
///
/// A referenced variable that is not set is a configuration error.
pub fn expand_env_string(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            // Unterminated reference: keep the remainder literally.
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let name = &after[..close];
        let value = std::env::var(name).map_err(|_| {
            GatewayError::Config(format!(
                "Environment variable '{name}' not found (referenced in config)"
            ))
        })?;
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Deserialize `Option<u64>` that may be a number or a string referencing `${ENV}`.
fn deserialize_option_u64_env<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as DeError;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom("expected unsigned integer")),
        Some(serde_json::Value::String(s)) => {
            let expanded = expand_env_string(&s).map_err(D::Error::custom)?;
            let expanded = expanded.trim();
            expanded.parse::<u64>().map(Some).map_err(|e| {
                D::Error::custom(format!("expected unsigned integer, got '{expanded}': {e}"))
            })
        }
        Some(other) => Err(D::Error::custom(format!(
            "expected unsigned integer or string, got {other}"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================
