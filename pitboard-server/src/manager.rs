//! Sample source lifecycle manager
//!
//! This module handles:
//! - Polling sources for detection
//! - Starting/stopping sources as they appear and disappear
//! - Reading raw samples from the active source
//! - Stamping and broadcasting samples and session info to engine instances

use crate::state::{AppState, StampedSample};
use anyhow::Result;
use pitboard_core::SessionInfo;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DETECTION_INTERVAL: Duration = Duration::from_secs(1);
const SAMPLE_INTERVAL: Duration = Duration::from_millis(16); // ~60Hz

/// Main manager loop
pub async fn run(state: AppState, cancel: CancellationToken) {
    info!("Source manager started");

    let mut last_detection: Option<Instant> = None;
    let mut last_session: Option<SessionInfo> = None;

    loop {
        // Rate limit detection checks to once per second
        if last_detection.map_or(true, |t| t.elapsed() >= DETECTION_INTERVAL) {
            last_detection = Some(Instant::now());
            if let Err(e) = detection_cycle(&state, &mut last_session).await {
                error!("Error in detection cycle: {}", e);
            }
        }

        if let Err(e) = sample_read_cycle(&state).await {
            error!("Error reading samples: {}", e);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(SAMPLE_INTERVAL) => {}
        }
    }

    let mut sources = state.sources.write().await;
    for source in sources.iter_mut().filter(|s| s.is_active()) {
        if let Err(e) = source.stop() {
            error!("Error stopping source {}: {}", source.key(), e);
        }
    }
    info!("Source manager stopped");
}

/// Check all sources for detection, and forward session info when it changes
async fn detection_cycle(state: &AppState, last_session: &mut Option<SessionInfo>) -> Result<()> {
    let mut sources = state.sources.write().await;
    let mut active_source = state.active_source.write().await;

    // If we have an active source, check if it's still detected
    if let Some(ref active_key) = *active_source {
        if let Some(source) = sources.iter_mut().find(|s| s.key() == active_key) {
            if !source.detect() {
                info!("Source {} no longer detected, stopping", active_key);
                if let Err(e) = source.stop() {
                    error!("Error stopping source {}: {}", active_key, e);
                }
                *active_source = None;
                *last_session = None;
                return Ok(());
            }

            let session = source.session_info();
            if session.is_some() && session != *last_session {
                if let Some(info) = session.clone() {
                    let _ = state.session_tx.send(info);
                }
                *last_session = session;
            }
            return Ok(());
        }
    }

    // No active source, look for detected ones
    for source in sources.iter_mut() {
        if source.detect() && !source.is_active() {
            info!("Source {} detected, starting", source.name());
            match source.start() {
                Ok(_) => {
                    *active_source = Some(source.key().to_string());
                    info!("Source {} started successfully", source.name());
                    break;
                }
                Err(e) => {
                    error!("Failed to start source {}: {}", source.name(), e);
                }
            }
        }
    }

    Ok(())
}

/// Read a sample from the active source and broadcast it
async fn sample_read_cycle(state: &AppState) -> Result<()> {
    let Some(active_key) = state.active_source.read().await.clone() else {
        return Ok(());
    };

    let mut sources = state.sources.write().await;

    if let Some(source) = sources.iter_mut().find(|s| s.key() == active_key) {
        match source.read_sample() {
            Ok(Some(raw)) => {
                // Ignore error if no receivers (they'll get the next sample)
                let _ = state.samples_tx.send(StampedSample::now(raw));
            }
            Ok(None) => {
                // No data available, that's fine
            }
            Err(e) => {
                warn!("Error reading sample from {}: {}", active_key, e);
            }
        }
    }

    Ok(())
}
