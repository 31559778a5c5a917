//! Engine instance actor
//!
//! Each instance is one tokio task that owns one [`Engine`]. Samples, session
//! info, peer messages, the periodic tick, and control commands are all
//! consumed from a single `select!` loop, so the engine sees one sequential
//! timeline and needs no locking. Outbound effects (publish, save, clear) are
//! performed fire-and-forget and never block that loop.

use crate::state::AppState;
use chrono::Utc;
use pitboard_core::engine::{Engine, EngineUpdate};
use pitboard_core::store::SNAPSHOT_KEY;
use pitboard_core::{EngineConfig, InstanceId, MetricsRecord, Outbound};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Control requests handled on the instance's own timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceCommand {
    Reset,
    SetPersistence(bool),
}

/// Handle kept in [`AppState`] for talking to a running instance
#[derive(Clone)]
pub struct InstanceHandle {
    id: InstanceId,
    metrics: Arc<RwLock<MetricsRecord>>,
    metrics_tx: broadcast::Sender<MetricsRecord>,
    commands: mpsc::Sender<InstanceCommand>,
}

impl InstanceHandle {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Latest metrics snapshot
    pub async fn metrics(&self) -> MetricsRecord {
        self.metrics.read().await.clone()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<MetricsRecord> {
        self.metrics_tx.subscribe()
    }

    pub async fn send(&self, command: InstanceCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("instance {} has stopped", self.id))
    }
}

/// Start an instance, register it, and ask the central store for state
pub async fn spawn(
    state: &AppState,
    id: InstanceId,
    config: &EngineConfig,
    cancel: CancellationToken,
) -> (InstanceHandle, JoinHandle<()>) {
    let persistence = *state.persistence_enabled.read().await;
    let engine = Engine::new(id.clone(), config).with_persistence(persistence);

    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (metrics_tx, _) = broadcast::channel(64);
    let handle = InstanceHandle {
        id: id.clone(),
        metrics: Arc::new(RwLock::new(engine.metrics())),
        metrics_tx,
        commands: commands_tx,
    };

    let actor = Actor {
        engine,
        state: state.clone(),
        handle: handle.clone(),
        samples: state.subscribe_samples(),
        sessions: state.session_tx.subscribe(),
        peers: state.subscribe_peer(),
        commands: commands_rx,
    };
    state.register_instance(handle.clone()).await;

    let task = tokio::spawn(actor.run(cancel));
    (handle, task)
}

struct Actor {
    engine: Engine,
    state: AppState,
    handle: InstanceHandle,
    samples: broadcast::Receiver<crate::state::StampedSample>,
    sessions: broadcast::Receiver<pitboard_core::SessionInfo>,
    peers: broadcast::Receiver<pitboard_core::PeerMessage>,
    commands: mpsc::Receiver<InstanceCommand>,
}

impl Actor {
    async fn run(mut self, cancel: CancellationToken) {
        let id = self.engine.id().clone();
        info!(instance = %id, "engine instance started");

        // Subscribed to the peer channel already, so the reply can't be missed
        self.state.publish(self.engine.request_initial_state());

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,

                sample = self.samples.recv() => match sample {
                    Ok(sample) => self.engine.ingest(&sample.raw, sample.received_at),
                    Err(RecvError::Lagged(n)) => {
                        warn!(instance = %id, "dropped {} samples", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },

                info = self.sessions.recv() => match info {
                    Ok(info) => {
                        self.engine.ingest_session_info(&info);
                        EngineUpdate::default()
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },

                message = self.peers.recv() => match message {
                    Ok(message) => self.engine.handle_peer(message, Utc::now()),
                    Err(RecvError::Lagged(n)) => {
                        // The next periodic publish from the broadcaster heals this
                        warn!(instance = %id, "dropped {} peer messages", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },

                command = self.commands.recv() => match command {
                    Some(InstanceCommand::Reset) => self.engine.reset(Utc::now()),
                    Some(InstanceCommand::SetPersistence(enabled)) => {
                        self.engine.set_persistence(enabled)
                    }
                    None => break,
                },

                _ = tick.tick() => self.engine.tick(Utc::now()),
            };

            self.apply(update).await;
        }

        info!(instance = %id, "engine instance stopping");
        let update = self.engine.shutdown(Utc::now());
        // Best effort: wait for the final save, but don't insist
        if let Some(task) = self.perform(update.outbound) {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }

    async fn apply(&mut self, update: EngineUpdate) {
        for event in &update.events {
            debug!(instance = %self.handle.id, ?event, "engine event");
        }
        let notify = !update.events.is_empty();
        self.perform(update.outbound);

        let metrics = self.engine.metrics();
        *self.handle.metrics.write().await = metrics.clone();
        if notify {
            let _ = self.handle.metrics_tx.send(metrics);
        }
    }

    /// Carry out side effects. Store writes from one update run in order on
    /// a single blocking task, so a save never lands after the clear that
    /// follows it.
    fn perform(&self, outbound: Vec<Outbound>) -> Option<JoinHandle<()>> {
        let mut store_ops = Vec::new();
        for effect in outbound {
            match effect {
                Outbound::Publish(message) => self.state.publish(message),
                other => store_ops.push(other),
            }
        }
        if store_ops.is_empty() {
            return None;
        }

        let store = self.state.store.clone();
        let id = self.handle.id.clone();
        Some(tokio::task::spawn_blocking(move || {
            for op in store_ops {
                let result = match op {
                    Outbound::SaveSnapshot(bytes) => store.set(SNAPSHOT_KEY, &bytes, Utc::now()),
                    Outbound::ClearSnapshot => store.remove(SNAPSHOT_KEY),
                    Outbound::Publish(_) => Ok(()),
                };
                if let Err(e) = result {
                    warn!(instance = %id, "snapshot store update failed: {}", e);
                }
            }
        }))
    }
}
