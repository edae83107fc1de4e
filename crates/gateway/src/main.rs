use anyhow::Context as _;
use clap::Parser;
use std::collections::HashSet;
use std::io::{IsTerminal as _, stdout};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use unrelated_namespace_gateway::{
    access::StaticAccess,
    aggregator::{AggregatorFactory, AggregatorSettings},
    config::{CliArgs, GatewayConfig},
    http::{self, GatewayState},
    pool::{IdlePool, PoolConfig},
    rmcp_backend::RmcpConnector,
    session::SessionRegistry,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = GatewayConfig::load(args).context("load configuration")?;

    if config.cli.print_effective_config {
        let effective = serde_json::to_string_pretty(&config.effective())
            .context("serialize effective config")?;
        println!("{effective}");
        return Ok(());
    }

    init_logging(&config.gateway.log_level);
    tracing::info!("Starting Unrelated MCP Namespace Gateway v{VERSION}");
    Box::pin(run(config)).await
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let settings = &config.gateway;
    let ct = CancellationToken::new();

    let factory = Arc::new(AggregatorFactory::new(
        config.namespaces.clone(),
        Arc::new(RmcpConnector),
        AggregatorSettings {
            startup_timeout: settings.startup_timeout_duration(),
            call_timeout: settings.call_timeout_duration(),
        },
    ));
    let pool = IdlePool::new(
        factory,
        PoolConfig {
            depth: settings.pool.depth,
            max_idle_age: settings.pool.max_idle_age_duration(),
            backoff_min: settings.pool.backoff_min_duration(),
            backoff_max: settings.pool.backoff_max_duration(),
            startup_timeout: settings.startup_timeout_duration(),
        },
    );
    let registry = SessionRegistry::new(pool.clone(), settings.session_idle_timeout_duration());

    let access = Arc::new(StaticAccess::new(config.endpoints.clone()));
    let state = Arc::new(GatewayState {
        registry: registry.clone(),
        resolver: access.clone(),
        verifier: access,
        sse_keep_alive: settings.sse_keep_alive_duration(),
        admin_token: settings.admin_token.clone(),
        start_time: Instant::now(),
        shutdown: ct.clone(),
    });

    tracing::info!(
        namespaces = config.namespaces.len(),
        endpoints = config.endpoints.len(),
        pool_depth = settings.pool.depth,
        "Configuration loaded"
    );

    let bind = parse_socket_addr(&settings.bind, "bind")?;
    let (listener, _addr) = bind_and_log(bind, "data", "bind").await?;

    registry.spawn_idle_reaper(settings.reaper_interval_duration(), ct.clone());
    pool.spawn_eviction_task(settings.pool.eviction_interval_duration());
    pool.spawn_warmup(
        settings.pool.warmup_delay_duration(),
        referenced_namespaces(&config),
    );

    spawn_shutdown_watcher(ct.clone());

    let server_ct = ct.clone();
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move {
            server_ct.cancelled().await;
        })
        .await
        .context("serve data plane")?;

    registry.shutdown_all().await;
    pool.shutdown().await;
    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

/// Namespaces reachable through at least one endpoint, in a stable order.
fn referenced_namespaces(config: &GatewayConfig) -> Vec<String> {
    let mut namespaces: Vec<String> = config
        .endpoints
        .values()
        .map(|e| e.namespace.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    namespaces.sort();
    namespaces
}

fn parse_socket_addr(value: &str, name: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("invalid {name} address '{value}'"))
}

async fn bind_and_log(
    addr: SocketAddr,
    label: &'static str,
    name: &'static str,
) -> anyhow::Result<(tokio::net::TcpListener, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {name} address '{addr}'"))?;
    let bound = listener
        .local_addr()
        .with_context(|| format!("get {name} bind address"))?;
    tracing::info!("Starting {label} plane HTTP server on {bound}");
    Ok((listener, bound))
}

fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Check if stdout is a TTY for format selection.
    let is_tty = stdout().is_terminal();

    if is_tty {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
