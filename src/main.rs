// src/main.rs
mod config;
mod coordinator;
mod db;
mod error;
mod events;
mod handlers;
mod models;
mod poll;
mod routes;
mod socket;
mod store;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum_server::Handle;
use dotenvy::dotenv;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use poll::SessionSettings;
use routes::AppState;
use store::{MemoryStore, PollStore, StoreSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok(); // Load environment variables from .env file

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let store = connect_store(&config).await;
    info!("Using {} for poll history", store.backend());

    let (sink, writer) = StoreSink::spawn(store.clone());
    let (coordinator, _coordinator_task) =
        coordinator::spawn(SessionSettings::from(&config), sink.clone());

    let address: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address()))?;
    info!("Serving client bundle from {}", config.static_dir.display());

    let app = routes::create_routes(AppState {
        coordinator,
        store,
        config: Arc::new(config),
    });

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    info!("Server running on {address}");
    axum_server::bind(address)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("server error")?;

    // Let queued writes reach the store before exiting.
    sink.flush().await;
    drop(sink);
    writer.abort();
    info!("Server stopped");
    Ok(())
}

/// Postgres when `DATABASE_URL` is set and reachable, otherwise process memory.
async fn connect_store(config: &Config) -> Arc<dyn PollStore> {
    let Some(url) = &config.database_url else {
        info!("DATABASE_URL not set, using in-memory storage");
        return Arc::new(MemoryStore::new());
    };

    let pool = match db::create_pool(url, config.db_max_connections).await {
        Ok(pool) => pool,
        Err(e) => {
            warn!("Database connection error: {e}. Falling back to in-memory storage");
            return Arc::new(MemoryStore::new());
        }
    };

    if let Err(e) = db::init_schema(&pool).await {
        warn!("Failed to prepare database schema: {e}. Falling back to in-memory storage");
        return Arc::new(MemoryStore::new());
    }

    info!("Connected to Postgres");
    Arc::new(db::PgStore::new(pool))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
