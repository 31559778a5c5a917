//! Application state management

use crate::config::ServerConfig;
use crate::instance::InstanceHandle;
use chrono::{DateTime, Utc};
use pitboard_core::{
    adapter::SampleSource, InstanceId, PeerMessage, RawSample, SessionInfo, SnapshotStore,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Raw sample plus the time the host received it
#[derive(Debug, Clone)]
pub struct StampedSample {
    pub raw: RawSample,
    pub received_at: DateTime<Utc>,
}

impl StampedSample {
    pub fn now(raw: RawSample) -> Self {
        Self {
            raw,
            received_at: Utc::now(),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,

    /// All registered sample sources
    pub sources: Arc<RwLock<Vec<Box<dyn SampleSource>>>>,

    /// Key of the currently active source
    pub active_source: Arc<RwLock<Option<String>>>,

    /// Inbound samples, fanned out to every engine instance
    pub samples_tx: broadcast::Sender<StampedSample>,

    /// Inbound session metadata
    pub session_tx: broadcast::Sender<SessionInfo>,

    /// Peer replication channel
    pub peer_tx: broadcast::Sender<PeerMessage>,

    /// Engine instances hosted in this process
    pub instances: Arc<RwLock<BTreeMap<InstanceId, InstanceHandle>>>,

    /// Whether the central snapshot is kept
    pub persistence_enabled: Arc<RwLock<bool>>,

    /// Central snapshot store
    pub store: Arc<dyn SnapshotStore>,
}

impl AppState {
    pub fn new(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        // ~4s of samples at 60Hz
        let (samples_tx, _) = broadcast::channel(256);
        let (session_tx, _) = broadcast::channel(16);
        let (peer_tx, _) = broadcast::channel(256);
        let persistence_enabled = config.persistence_enabled;

        Self {
            config: Arc::new(config),
            sources: Arc::new(RwLock::new(Vec::new())),
            active_source: Arc::new(RwLock::new(None)),
            samples_tx,
            session_tx,
            peer_tx,
            instances: Arc::new(RwLock::new(BTreeMap::new())),
            persistence_enabled: Arc::new(RwLock::new(persistence_enabled)),
            store,
        }
    }

    /// Register a sample source
    pub async fn register_source(&self, source: Box<dyn SampleSource>) {
        let mut sources = self.sources.write().await;
        sources.push(source);
    }

    pub async fn register_instance(&self, handle: InstanceHandle) {
        let mut instances = self.instances.write().await;
        instances.insert(handle.id().clone(), handle);
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<StampedSample> {
        self.samples_tx.subscribe()
    }

    pub fn subscribe_peer(&self) -> broadcast::Receiver<PeerMessage> {
        self.peer_tx.subscribe()
    }

    /// Put a message on the peer channel. No subscribers is not an error:
    /// the next periodic publish covers anyone who joins later.
    pub fn publish(&self, message: PeerMessage) {
        if self.peer_tx.send(message).is_err() {
            tracing::debug!("no peers subscribed");
        }
    }
}
