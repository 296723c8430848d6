//! ferrumqd: the FerrumQ broker daemon.

use ferrumq_broker::repository::Repository;
use ferrumq_broker::server::Server;
use ferrumq_broker::session::SessionRegistry;
use ferrumq_broker::BrokerConfig;
use ferrumq_core::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Configuration file consulted when no path is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "ferrumq.toml";

async fn run() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => BrokerConfig::load(&path)?,
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            BrokerConfig::load(DEFAULT_CONFIG_PATH)?
        },
        None => {
            info!("no configuration file, using defaults");
            BrokerConfig::default()
        },
    };
    let config = Arc::new(config);

    let repository =
        Arc::new(Repository::new(Arc::clone(&config), Arc::new(SessionRegistry::new())));
    repository.activate().await?;
    repository.broadcast_activation().await;
    info!("queue manager {} active", repository.manager_name());

    let server = Server::new(Arc::clone(&config), Arc::clone(&repository));

    let shutdown = server.shutdown_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown.send(());
        }
    });

    server.run().await?;

    // Tell peers first so they drop our proxies and sessions, then persist
    // every queue.
    repository.broadcast_deactivation().await;
    repository.deactivate().await?;
    info!("queue manager {} stopped", repository.manager_name());
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("broker failed: {e}");
        std::process::exit(1);
    }
}
