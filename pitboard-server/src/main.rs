//! Pitboard Server
//!
//! Hosts engine instances, the peer relay and the dashboard REST API

use anyhow::Result;
use pitboard_adapters::DemoSource;
use pitboard_core::InstanceId;
use pitboard_server::{api, config::ServerConfig, instance, manager, relay, state, store::FileStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Pitboard Server");

    let config = ServerConfig::load()?;
    let addr = config.socket_addr()?;
    let store = FileStore::open(config.store_dir())?;
    info!("Snapshots stored in {}", store.dir().display());

    // Create application state
    let state = state::AppState::new(config.clone(), Arc::new(store));
    state.register_source(Box::new(DemoSource::new())).await;

    let cancel = CancellationToken::new();

    // The relay answers initial state requests, so it starts first
    let relay_task = tokio::spawn(relay::run(state.clone(), cancel.clone()));
    let manager_task = tokio::spawn(manager::run(state.clone(), cancel.clone()));

    let mut instance_tasks = Vec::with_capacity(config.instances);
    for n in 1..=config.instances {
        let id = InstanceId::new(format!("instance-{}", n));
        let (_, task) = instance::spawn(&state, id, &config.engine, cancel.clone()).await;
        instance_tasks.push(task);
    }

    // Build the router
    let app = api::create_router(state.clone());

    info!("Server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    // Instances flush their final snapshot before exiting
    cancel.cancel();
    for task in instance_tasks {
        let _ = task.await;
    }
    let _ = manager_task.await;
    let _ = relay_task.await;

    Ok(())
}
