use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LogFormat, LoggingConfig, StoreBackend, StoreConfig};
use gatekeeper::grpc::GrpcServer;
use gatekeeper::ratelimit::store::{MemoryStore, QuotaStore, RedisStore};
use gatekeeper::ratelimit::{spawn_reloader, DecisionEngine, PolicyRegistry};

/// Centralized rate limiting decision engine.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Override the log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting Gatekeeper Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let store = connect_store(&config.store).await?;

    let registry = Arc::new(PolicyRegistry::new(config.rate_limiting.policy_table()?));
    info!(
        policies = registry.snapshot().table.policies().count(),
        "Policy table loaded"
    );

    let reloader = match (&config.rate_limiting.config_path, config.rate_limiting.reload_interval()) {
        (Some(path), Some(interval)) => {
            info!(path = %path, interval_secs = interval.as_secs(), "Watching policy file");
            Some(spawn_reloader(registry.clone(), PathBuf::from(path), interval))
        }
        _ => None,
    };

    let engine = Arc::new(
        DecisionEngine::new(store, registry).with_settings(config.store.engine_settings()),
    );
    if let Err(e) = engine.health().await {
        warn!(error = %e, "Quota store not reachable at startup, checks will fail open");
    }
    info!(instance_id = %engine.instance_id(), "Decision engine initialized");

    let grpc_server = GrpcServer::new(config.server.grpc_addr, engine);

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(handle) = reloader {
        handle.abort();
    }

    info!("Gatekeeper Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn connect_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn QuotaStore>> {
    let store: Arc<dyn QuotaStore> = match config.backend {
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.redis_url).await?),
        StoreBackend::Memory => {
            warn!("Using the in-memory store; quotas are not shared across instances");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
