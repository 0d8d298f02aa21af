use anyhow::Context as _;
use clap::Parser;
use gatehouse_gateway::config::GatewayConfig;
use gatehouse_gateway::policy::load_policies_from_file;
use gatehouse_gateway::state::{GatewayState, build_router};
use gatehouse_gateway::store::MemorySessionStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gatehouse-gateway", version, about)]
struct Args {
    /// Path to the gateway YAML config.
    #[arg(long, env = "GATEHOUSE_CONFIG", default_value = "gatehouse.yaml")]
    config: PathBuf,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, env = "GATEHOUSE_LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = GatewayConfig::from_file(&args.config)?;

    let policies = match &config.policies_path {
        Some(path) => load_policies_from_file(path)?,
        None => HashMap::new(),
    };

    let session_store = Arc::new(MemorySessionStore::new());
    let state = GatewayState::new(
        config,
        policies,
        session_store.clone(),
        session_store.clone(),
    )?;

    let shutdown = CancellationToken::new();
    state.jwks.clone().spawn_sweeper(
        Duration::from_secs(state.config.jwks_cache.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );
    state.events.spawn_logger(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.listen_addr)
        .await
        .with_context(|| format!("bind {}", state.config.listen_addr))?;
    info!(
        addr = %listener.local_addr()?,
        apis = state.config.apis.len(),
        "gatehouse listening"
    );

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .context("serve")?;

    shutdown.cancel();
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
