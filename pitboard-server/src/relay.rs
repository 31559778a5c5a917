//! Peer relay
//!
//! The process-wide end of the peer channel. Owns the central snapshot store
//! and the persistence flag: it clears the store on reset or when
//! persistence is turned off, and answers `RequestInitialState` from the
//! store.

use crate::state::AppState;
use chrono::Utc;
use pitboard_core::replicator::initial_state_reply;
use pitboard_core::store::SNAPSHOT_KEY;
use pitboard_core::PeerMessage;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Main relay loop
pub async fn run(state: AppState, cancel: CancellationToken) {
    let mut rx = state.subscribe_peer();
    info!("Peer relay started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Ok(message) => handle(&state, message).await,
                Err(RecvError::Lagged(n)) => warn!("relay dropped {} peer messages", n),
                Err(RecvError::Closed) => break,
            },
        }
    }
    info!("Peer relay stopped");
}

/// React to one peer message
pub async fn handle(state: &AppState, message: PeerMessage) {
    match message {
        PeerMessage::Reset { origin } => {
            info!(origin = %origin, "reset requested, clearing snapshot");
            clear_store(state).await;
        }
        PeerMessage::SetPersistence { origin, enabled } => {
            info!(origin = %origin, enabled, "persistence changed");
            *state.persistence_enabled.write().await = enabled;
            if !enabled {
                clear_store(state).await;
            }
        }
        PeerMessage::RequestInitialState { origin } => {
            let enabled = *state.persistence_enabled.read().await;
            let store = state.store.clone();
            let retention = state.config.engine.snapshot_retention();
            debug!(origin = %origin, enabled, "answering initial state request");

            let reply = tokio::task::spawn_blocking(move || {
                initial_state_reply(store.as_ref(), enabled, origin, retention, Utc::now())
            })
            .await;
            match reply {
                Ok(reply) => state.publish(reply),
                Err(e) => warn!("initial state lookup failed: {}", e),
            }
        }
        PeerMessage::State(_) | PeerMessage::InitialState { .. } => {}
    }
}

async fn clear_store(state: &AppState) {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.remove(SNAPSHOT_KEY)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failed to clear snapshot: {}", e),
        Err(e) => warn!("snapshot clear task failed: {}", e),
    }
}
