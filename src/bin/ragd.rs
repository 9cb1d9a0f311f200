//! RAG service daemon
//!
//! Loads configuration, initializes the service factory, starts health
//! monitoring and serves the REST API until interrupted.

use ragd::api::{start_server, AppState};
use ragd::{HealthMonitor, RagConfig, ServiceFactory};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            RagConfig::from_file(&path)?
        }
        None => {
            info!("Using default configuration");
            RagConfig::default()
        }
    };

    config.ensure_directories()?;

    let factory = ServiceFactory::initialize(config.clone()).await;

    let monitor = HealthMonitor::new(factory.clone(), config.monitor.clone());
    monitor.start();

    let state = AppState {
        factory: factory.clone(),
    };

    let host = config.api.host.clone();
    let port = config.api.port;

    tokio::select! {
        result = start_server(state, &host, port) => {
            if let Err(e) = result {
                error!("Server exited with error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    monitor.shutdown();
    factory.shutdown();
    info!("Goodbye");
    Ok(())
}
