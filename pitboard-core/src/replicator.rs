//! State replicator
//!
//! Keeps [`SessionState`] eventually consistent across engine instances over
//! a shared publish/subscribe channel. There is no central authority: the
//! last envelope applied wins, field by field.
//!
//! Applying a remote envelope raises an apply guard for a short window.
//! While it is up the instance does not publish, so state that arrived from
//! a peer is never re-broadcast as if it were a local change.

use crate::state::{SessionState, StatePatch};
use crate::store::{load_snapshot, SnapshotStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Identity of one engine instance on the peer channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partial state snapshot plus the instance that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStateEnvelope {
    pub origin: InstanceId,
    pub payload: StatePatch,
}

/// Everything that travels on the peer channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    State(RemoteStateEnvelope),
    /// Clear state on every instance and the persisted snapshot
    Reset { origin: InstanceId },
    SetPersistence { origin: InstanceId, enabled: bool },
    RequestInitialState { origin: InstanceId },
    /// Reply to `RequestInitialState`; `None` means start empty
    InitialState {
        to: InstanceId,
        payload: Option<StatePatch>,
    },
}

impl PeerMessage {
    /// Sending instance, if the message has one
    pub fn origin(&self) -> Option<&InstanceId> {
        match self {
            PeerMessage::State(envelope) => Some(&envelope.origin),
            PeerMessage::Reset { origin }
            | PeerMessage::SetPersistence { origin, .. }
            | PeerMessage::RequestInitialState { origin } => Some(origin),
            PeerMessage::InitialState { .. } => None,
        }
    }
}

/// Side effects the host performs on the engine's behalf, fire-and-forget
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Publish(PeerMessage),
    SaveSnapshot(Vec<u8>),
    ClearSnapshot,
}

/// Anti-echo guard
///
/// ```text
///   Idle --engage(now)--> ApplyingRemote { until: now + window } --now >= until--> Idle
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApplyGuard {
    #[default]
    Idle,
    ApplyingRemote { until: DateTime<Utc> },
}

impl ApplyGuard {
    /// (Re)arm the guard. A second apply inside the window extends it.
    pub fn engage(&mut self, now: DateTime<Utc>, window: Duration) {
        *self = ApplyGuard::ApplyingRemote { until: now + window };
    }

    /// Whether the guard is up at `now`; drops back to `Idle` once expired
    pub fn is_active(&mut self, now: DateTime<Utc>) -> bool {
        match *self {
            ApplyGuard::Idle => false,
            ApplyGuard::ApplyingRemote { until } if now >= until => {
                *self = ApplyGuard::Idle;
                false
            }
            ApplyGuard::ApplyingRemote { .. } => true,
        }
    }
}

pub struct Replicator {
    id: InstanceId,
    guard: ApplyGuard,
    guard_window: Duration,
    publish_interval: Duration,
    save_interval: Duration,
    last_published: Option<DateTime<Utc>>,
    last_saved: Option<DateTime<Utc>>,
    persistence_enabled: bool,
}

impl Replicator {
    pub fn new(
        id: InstanceId,
        guard_window: Duration,
        publish_interval: Duration,
        save_interval: Duration,
    ) -> Self {
        Self {
            id,
            guard: ApplyGuard::Idle,
            guard_window,
            publish_interval,
            save_interval,
            last_published: None,
            last_saved: None,
            persistence_enabled: true,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn guard(&self) -> ApplyGuard {
        self.guard
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence_enabled
    }

    pub fn set_persistence_enabled(&mut self, enabled: bool) {
        self.persistence_enabled = enabled;
    }

    /// Own messages come back through the fan-out and must be dropped
    pub fn is_own(&self, message: &PeerMessage) -> bool {
        message.origin() == Some(&self.id)
    }

    /// Full-state publish, unless the apply guard is up
    pub fn publish(&mut self, state: &SessionState, now: DateTime<Utc>) -> Option<Outbound> {
        if self.guard.is_active(now) {
            debug!(instance = %self.id, "publish suppressed while applying remote state");
            return None;
        }
        self.last_published = Some(now);
        Some(Outbound::Publish(PeerMessage::State(RemoteStateEnvelope {
            origin: self.id.clone(),
            payload: state.to_patch(),
        })))
    }

    /// Periodic publish and save, each when its interval has elapsed
    pub fn tick(&mut self, state: &SessionState, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        if is_due(self.last_published, self.publish_interval, now) {
            outbound.extend(self.publish(state, now));
        }
        if self.persistence_enabled && is_due(self.last_saved, self.save_interval, now) {
            outbound.extend(self.save(state, now));
        }
        outbound
    }

    /// Encoded snapshot for the store, or `None` when persistence is off
    pub fn save(&mut self, state: &SessionState, now: DateTime<Utc>) -> Option<Outbound> {
        if !self.persistence_enabled {
            return None;
        }
        self.last_saved = Some(now);
        match crate::store::encode_snapshot(state) {
            Ok(bytes) => Some(Outbound::SaveSnapshot(bytes)),
            Err(e) => {
                warn!(instance = %self.id, "failed to encode snapshot: {}", e);
                None
            }
        }
    }

    /// Overwrite local fields from a peer's patch and raise the guard
    pub fn apply_remote(&mut self, state: &mut SessionState, patch: StatePatch, now: DateTime<Utc>) {
        state.apply_patch(patch);
        self.guard.engage(now, self.guard_window);
    }

    pub fn reset_message(&self) -> PeerMessage {
        PeerMessage::Reset {
            origin: self.id.clone(),
        }
    }

    pub fn persistence_message(&self, enabled: bool) -> PeerMessage {
        PeerMessage::SetPersistence {
            origin: self.id.clone(),
            enabled,
        }
    }

    pub fn initial_state_request(&self) -> PeerMessage {
        PeerMessage::RequestInitialState {
            origin: self.id.clone(),
        }
    }
}

fn is_due(last: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    last.map_or(true, |last| now - last >= interval)
}

/// Answer a `RequestInitialState` from the central store.
///
/// With persistence disabled, or no valid snapshot, the requester is told to
/// start from empty state.
pub fn initial_state_reply(
    store: &dyn SnapshotStore,
    persistence_enabled: bool,
    requester: InstanceId,
    retention: Duration,
    now: DateTime<Utc>,
) -> PeerMessage {
    let payload = if persistence_enabled {
        load_snapshot(store, retention, now)
    } else {
        None
    };
    PeerMessage::InitialState {
        to: requester,
        payload,
    }
}
