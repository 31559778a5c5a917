//! Engine façade
//!
//! One [`Engine`] owns one [`SessionState`] and processes every input on a
//! single sequential timeline. The host calls a method per inbound message
//! and gets back an [`EngineUpdate`]: what happened, and which side effects
//! (publish, save, clear) to perform. The engine itself never does I/O.

use crate::config::EngineConfig;
use crate::gate::{BufferGate, GateTransition};
use crate::lap::{FuelObservation, LapPipeline};
use crate::metrics::{DerivedMetrics, GateStatus, MetricsRecord, StintReport};
use crate::replicator::{InstanceId, Outbound, PeerMessage, Replicator};
use crate::sample::{RawSample, Sample, SessionInfo};
use crate::state::{Derived, GatePhase, SessionState, StatePatch, StintSummary};
use crate::stint::{PitRoadEdge, PitStop, StintBoundary, StintBoundaryEvent, StintTracker};
use crate::store::{load_snapshot, SnapshotStore};
use crate::units::{Laps, Liters, Seconds};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

/// Something the engine observed while processing an input
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    DriverEntered {
        lap: i32,
    },
    WentLive {
        lap: i32,
    },
    DriverExited {
        lap: i32,
    },
    LapCompleted {
        lap: i32,
        lap_time: Option<f64>,
        fuel_used: Option<f64>,
        derived: Derived,
    },
    FuelUsageRejected {
        lap: i32,
        value: f64,
    },
    PitEntered {
        at: DateTime<Utc>,
    },
    PitExited {
        stop_secs: Option<f64>,
    },
    PitStopDiscarded {
        secs: f64,
    },
    StintFinalized(StintSummary),
    /// `origin` is `None` when the state came from the central store
    RemoteApplied {
        origin: Option<InstanceId>,
    },
    /// `origin` is `None` for a local reset
    Reset {
        origin: Option<InstanceId>,
    },
    PersistenceChanged {
        enabled: bool,
    },
}

/// Result of one engine call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineUpdate {
    pub events: Vec<EngineEvent>,
    pub outbound: Vec<Outbound>,
}

impl EngineUpdate {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.outbound.is_empty()
    }
}

pub struct Engine {
    state: SessionState,
    gate: BufferGate,
    laps: LapPipeline,
    stints: StintTracker,
    replicator: Replicator,
    /// Derived block frozen at the last lap completed while live
    display: Derived,
    last_sample: Option<Sample>,
    session_info: Option<SessionInfo>,
    updated_at: Option<DateTime<Utc>>,
}

impl Engine {
    pub fn new(id: InstanceId, config: &EngineConfig) -> Self {
        Self {
            state: SessionState::new(),
            gate: BufferGate::new(config.settle_laps),
            laps: LapPipeline::new(config.tank_capacity_liters, config.min_estimated_usage),
            stints: StintTracker::new(config),
            replicator: Replicator::new(
                id,
                config.apply_guard(),
                config.publish_interval(),
                config.save_interval(),
            ),
            display: Derived::default(),
            last_sample: None,
            session_info: None,
            updated_at: None,
        }
    }

    /// Set the starting persistence flag without announcing it to peers
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.replicator.set_persistence_enabled(enabled);
        self
    }

    /// Start from the persisted snapshot when one is present and fresh
    pub fn restore(
        id: InstanceId,
        config: &EngineConfig,
        store: &dyn SnapshotStore,
        now: DateTime<Utc>,
    ) -> Self {
        let mut engine = Self::new(id, config);
        if let Some(patch) = load_snapshot(store, config.snapshot_retention(), now) {
            engine.state.apply_patch(patch);
            engine.refresh_display();
            info!(
                instance = %engine.id(),
                lap = engine.state.last_lap_completed,
                "restored session snapshot"
            );
        }
        engine
    }

    pub fn id(&self) -> &InstanceId {
        self.replicator.id()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.session_info.as_ref()
    }

    pub fn persistence_enabled(&self) -> bool {
        self.replicator.persistence_enabled()
    }

    /// Normalize and process one raw sample
    pub fn ingest(&mut self, raw: &RawSample, now: DateTime<Utc>) -> EngineUpdate {
        self.ingest_sample(Sample::normalize(raw, now))
    }

    pub fn ingest_sample(&mut self, sample: Sample) -> EngineUpdate {
        let now = sample.timestamp;
        let mut update = EngineUpdate::default();
        let mut changed = false;

        let phase_before = self.state.gate_phase;
        let transition = self.gate.observe(&mut self.state, &sample);

        if phase_before == GatePhase::NoDriver && self.state.gate_phase != GatePhase::NoDriver {
            let lap = self.state.lap_entry_point.unwrap_or(0);
            debug!(instance = %self.id(), lap, "driver entered");
            // Laps count from the entry lap; a lower counter means the source restarted
            if lap < self.state.last_lap_completed {
                info!(
                    instance = %self.id(),
                    lap,
                    previous = self.state.last_lap_completed,
                    "lap counter restarted"
                );
                self.state.last_lap_at = None;
            }
            self.state.last_lap_completed = lap;
            self.stints.driver_entered(&mut self.state, &sample);
            update.events.push(EngineEvent::DriverEntered { lap });
            changed = true;
        }

        match transition {
            Some(GateTransition::WentLive { lap }) => {
                info!(instance = %self.id(), lap, "buffer live");
                update.events.push(EngineEvent::WentLive { lap });
            }
            Some(GateTransition::DriverExited { lap, last_gated }) => {
                debug!(instance = %self.id(), lap, "driver exited");
                update.events.push(EngineEvent::DriverExited { lap });
                let event = self.stints.driver_exited(&mut self.state, lap, &last_gated, now);
                self.push_finalized(&event, &mut update);
                changed = true;
            }
            Some(GateTransition::DriverEntered { .. })
            | Some(GateTransition::LapAdvanced { .. })
            | None => {}
        }

        match self.stints.observe_pit_road(&mut self.state, &sample) {
            Some(PitRoadEdge::Entered(event)) => {
                update.events.push(EngineEvent::PitEntered { at: event.at });
                self.push_finalized(&event, &mut update);
            }
            Some(PitRoadEdge::Exited { stop, .. }) => match stop {
                PitStop::Recorded(secs) => update.events.push(EngineEvent::PitExited {
                    stop_secs: Some(secs),
                }),
                PitStop::Discarded(secs) => {
                    update.events.push(EngineEvent::PitStopDiscarded { secs });
                    update.events.push(EngineEvent::PitExited { stop_secs: None });
                }
                PitStop::Unmeasured => update.events.push(EngineEvent::PitExited { stop_secs: None }),
            },
            None => {}
        }

        if let Some(done) = self.laps.observe(&mut self.state, &sample) {
            if let FuelObservation::Rejected(value) = done.fuel {
                update.events.push(EngineEvent::FuelUsageRejected {
                    lap: done.lap,
                    value,
                });
            }
            update.events.push(EngineEvent::LapCompleted {
                lap: done.lap,
                lap_time: done.lap_time,
                fuel_used: done.fuel.accepted(),
                derived: done.derived,
            });
            changed = true;
        }

        self.refresh_display();
        self.last_sample = Some(sample);
        self.updated_at = Some(now);

        if changed {
            update.outbound.extend(self.replicator.publish(&self.state, now));
        }
        update
    }

    /// Seed constants from session metadata
    pub fn ingest_session_info(&mut self, info: &SessionInfo) {
        if let Some(capacity) = info.tank_capacity() {
            if capacity != self.laps.tank_capacity() {
                debug!(instance = %self.id(), capacity, "tank capacity from session info");
            }
            self.laps.set_tank_capacity(capacity);
        }
        self.session_info = Some(info.clone());
    }

    pub fn handle_peer(&mut self, message: PeerMessage, now: DateTime<Utc>) -> EngineUpdate {
        let mut update = EngineUpdate::default();
        if self.replicator.is_own(&message) {
            return update;
        }

        match message {
            PeerMessage::State(envelope) => {
                self.apply_remote(envelope.payload, now);
                update.events.push(EngineEvent::RemoteApplied {
                    origin: Some(envelope.origin),
                });
            }
            PeerMessage::Reset { origin } => {
                info!(instance = %self.id(), origin = %origin, "reset by peer");
                self.clear();
                update.events.push(EngineEvent::Reset {
                    origin: Some(origin),
                });
            }
            PeerMessage::SetPersistence { enabled, .. } => {
                self.replicator.set_persistence_enabled(enabled);
                update.events.push(EngineEvent::PersistenceChanged { enabled });
            }
            PeerMessage::InitialState { to, payload } if to == *self.id() => {
                if let Some(patch) = payload {
                    self.apply_remote(patch, now);
                    update.events.push(EngineEvent::RemoteApplied { origin: None });
                }
            }
            // Answered by whoever holds the central store
            PeerMessage::RequestInitialState { .. } | PeerMessage::InitialState { .. } => {}
        }
        update
    }

    /// Periodic publish and save
    pub fn tick(&mut self, now: DateTime<Utc>) -> EngineUpdate {
        EngineUpdate {
            events: Vec::new(),
            outbound: self.replicator.tick(&self.state, now),
        }
    }

    /// Clear state here, on every peer, and in the store
    pub fn reset(&mut self, _now: DateTime<Utc>) -> EngineUpdate {
        info!(instance = %self.id(), "session reset");
        self.clear();
        EngineUpdate {
            events: vec![EngineEvent::Reset { origin: None }],
            outbound: vec![
                Outbound::Publish(self.replicator.reset_message()),
                Outbound::ClearSnapshot,
            ],
        }
    }

    /// Toggle the central snapshot. Turning it off also drops what is stored.
    pub fn set_persistence(&mut self, enabled: bool) -> EngineUpdate {
        self.replicator.set_persistence_enabled(enabled);
        let mut outbound = vec![Outbound::Publish(self.replicator.persistence_message(enabled))];
        if !enabled {
            outbound.push(Outbound::ClearSnapshot);
        }
        EngineUpdate {
            events: vec![EngineEvent::PersistenceChanged { enabled }],
            outbound,
        }
    }

    /// Best-effort final publish and save
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> EngineUpdate {
        let mut outbound = Vec::new();
        outbound.extend(self.replicator.publish(&self.state, now));
        outbound.extend(self.replicator.save(&self.state, now));
        EngineUpdate {
            events: Vec::new(),
            outbound,
        }
    }

    /// Message asking the central store for the current state
    pub fn request_initial_state(&self) -> PeerMessage {
        self.replicator.initial_state_request()
    }

    pub fn metrics(&self) -> MetricsRecord {
        let state = &self.state;
        let gated = state.gated_sample.as_ref();

        let laps_until_live = (state.gate_phase == GatePhase::Settling)
            .then(|| {
                let entry = state.lap_entry_point?;
                let current = state.last_observed_lap.unwrap_or(entry);
                Some(
                    entry
                        .saturating_add(self.gate.settle_laps())
                        .saturating_sub(current)
                        .max(0),
                )
            })
            .flatten();

        let progress = self
            .last_sample
            .as_ref()
            .map(|s| self.stints.progress(state, s))
            .unwrap_or_default();

        MetricsRecord {
            instance: self.id().clone(),
            updated_at: self.updated_at,
            gate: GateStatus {
                phase: state.gate_phase,
                buffer_frozen: state.buffer_frozen,
                lap_entry_point: state.lap_entry_point,
                laps_until_live,
            },
            last_lap_completed: (state.last_lap_completed >= 0).then_some(state.last_lap_completed),
            fuel_level: gated.map(|s| Liters(s.fuel_level)),
            live: DerivedMetrics::from(&state.derived),
            display: DerivedMetrics::from(&self.display),
            stint: StintReport {
                laps: progress.laps,
                fuel_used: progress.fuel_used.map(Liters),
                elapsed: progress.elapsed.map(Seconds),
                incidents: progress.incidents,
                pit_stops_recorded: state.stint.duration_history.len(),
                avg_pit_stop: state.stint.duration_history.mean().map(Seconds),
                avg_stint_laps: state.stint.lap_count_history.mean().map(Laps),
                last_tire_wear: state.stint.last_tire_wear_snapshot,
                last_summary: state.stint.last_summary.clone(),
            },
            persistence_enabled: self.persistence_enabled(),
        }
    }

    fn apply_remote(&mut self, patch: StatePatch, now: DateTime<Utc>) {
        self.replicator.apply_remote(&mut self.state, patch, now);
        self.refresh_display();
        self.updated_at = Some(now);
    }

    fn refresh_display(&mut self) {
        if !self.state.buffer_frozen {
            self.display = self.state.derived;
        }
    }

    fn clear(&mut self) {
        self.state = SessionState::new();
        self.display = Derived::default();
    }

    fn push_finalized(&self, event: &StintBoundaryEvent, update: &mut EngineUpdate) {
        if !matches!(event.boundary, StintBoundary::End(_)) {
            return;
        }
        if let Some(summary) = self
            .state
            .stint
            .last_summary
            .as_ref()
            .filter(|s| s.ended_at == event.at && s.source == event.source)
        {
            update.events.push(EngineEvent::StintFinalized(summary.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SNAPSHOT_KEY};
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 14, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            tank_capacity_liters: 104.0,
            ..Default::default()
        }
    }

    fn sample(on_track: bool, lap: i32, fuel: f64, secs: i64) -> Sample {
        let mut s = Sample::normalize(&RawSample::new(), t(secs));
        s.on_track = on_track;
        s.lap_completed = Some(lap);
        s.fuel_level = fuel;
        s.session_time_remain = (7200 - secs) as f64;
        s
    }

    #[test]
    fn test_lap_completion_publishes() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        let update = engine.ingest_sample(sample(true, 0, 104.0, 0));
        assert!(matches!(update.events[0], EngineEvent::DriverEntered { lap: 0 }));
        assert_eq!(update.outbound.len(), 1);

        assert!(engine.ingest_sample(sample(true, 0, 103.0, 30)).is_empty());

        let update = engine.ingest_sample(sample(true, 1, 101.0, 90));
        assert!(update
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::LapCompleted { lap: 1, .. })));
        assert!(matches!(update.outbound[0], Outbound::Publish(PeerMessage::State(_))));
    }

    #[test]
    fn test_display_block_freezes_while_settling() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        engine.ingest_sample(sample(true, 0, 104.0, 0));
        engine.ingest_sample(sample(true, 1, 101.0, 90));
        assert_eq!(engine.state().derived.fuel_avg3, Some(3.0));
        assert_eq!(engine.metrics().display.fuel_avg3, None);
        assert_eq!(engine.metrics().gate.laps_until_live, Some(1));

        let update = engine.ingest_sample(sample(true, 2, 98.0, 180));
        assert!(update.events.contains(&EngineEvent::WentLive { lap: 2 }));
        assert_eq!(engine.metrics().display.fuel_avg3, Some(Liters(3.0)));
        assert_eq!(engine.metrics().fuel_level, Some(Liters(98.0)));
    }

    #[test]
    fn test_driver_exit_finalizes_stint() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        engine.ingest_sample(sample(true, 0, 104.0, 0));
        for lap in 1..=4 {
            engine.ingest_sample(sample(true, lap, 104.0 - 3.0 * lap as f64, 90 * lap as i64));
        }
        let update = engine.ingest_sample(sample(false, 4, 92.0, 400));
        assert!(update.events.contains(&EngineEvent::DriverExited { lap: 4 }));
        let summary = update
            .events
            .iter()
            .find_map(|e| match e {
                EngineEvent::StintFinalized(s) => Some(s.clone()),
                _ => None,
            })
            .expect("stint summary");
        assert_eq!(summary.lap_count, Some(4));
        assert_eq!(summary.duration, Some(400.0));
    }

    #[test]
    fn test_lap_counter_restart_after_driver_exit() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        for lap in 0..=10 {
            engine.ingest_sample(sample(true, lap, 104.0 - 3.0 * lap as f64, 90 * lap as i64));
        }
        engine.ingest_sample(sample(false, 10, 74.0, 1000));
        assert_eq!(engine.state().last_lap_completed, 10);

        let mut completed = Vec::new();
        for lap in 0..=5 {
            let update = engine.ingest_sample(sample(true, lap, 104.0 - 3.0 * lap as f64, 1100 + 90 * lap as i64));
            for event in update.events {
                if let EngineEvent::LapCompleted { lap, lap_time, .. } = event {
                    completed.push((lap, lap_time));
                }
            }
        }

        assert_eq!(completed.iter().map(|(lap, _)| *lap).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(completed[0].1, None, "no lap time across the restart");
        assert_eq!(completed[1].1, Some(90.0));
        assert_eq!(engine.state().last_lap_completed, 5);
    }

    #[test]
    fn test_stale_lap_inside_stint_is_still_ignored() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        for lap in 0..=4 {
            engine.ingest_sample(sample(true, lap, 104.0 - 3.0 * lap as f64, 90 * lap as i64));
        }
        let update = engine.ingest_sample(sample(true, 2, 98.0, 400));
        assert!(!update.events.iter().any(|e| matches!(e, EngineEvent::LapCompleted { .. })));
        assert_eq!(engine.state().last_lap_completed, 4);
    }

    #[test]
    fn test_huge_lap_counter_does_not_overflow() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        let mut raw = RawSample::new();
        raw.insert("IsOnTrack".into(), serde_json::json!(true));
        raw.insert("LapCompleted".into(), serde_json::json!(i32::MAX - 1));
        engine.ingest(&raw, t(0));

        let metrics = engine.metrics();
        assert_eq!(metrics.gate.lap_entry_point, Some(i32::MAX - 1));
        assert_eq!(metrics.gate.laps_until_live, Some(1));

        raw.insert("LapCompleted".into(), serde_json::json!(i32::MAX));
        raw.insert("OnPitRoad".into(), serde_json::json!(true));
        engine.ingest(&raw, t(1));
        raw.insert("IsOnTrack".into(), serde_json::json!(false));
        engine.ingest(&raw, t(2));
        assert_eq!(engine.metrics().gate.phase, GatePhase::NoDriver);
    }

    #[test]
    fn test_own_messages_are_dropped() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        let reset = engine.reset(t(0));
        let Outbound::Publish(msg) = reset.outbound[0].clone() else {
            panic!("expected publish");
        };
        engine.ingest_sample(sample(true, 3, 50.0, 10));
        assert!(engine.handle_peer(msg, t(11)).is_empty());
        assert_eq!(engine.state().gate_phase, GatePhase::Settling);
    }

    #[test]
    fn test_remote_reset_clears_without_echo() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        engine.ingest_sample(sample(true, 3, 50.0, 0));
        engine.ingest_sample(sample(true, 4, 47.0, 90));

        let update = engine.handle_peer(
            PeerMessage::Reset {
                origin: InstanceId::new("b"),
            },
            t(91),
        );
        assert!(update.outbound.is_empty());
        assert_eq!(engine.state(), &SessionState::new());
    }

    #[test]
    fn test_persistence_toggle() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        let update = engine.set_persistence(false);
        assert!(update.outbound.contains(&Outbound::ClearSnapshot));
        assert!(!engine.persistence_enabled());
        assert!(engine
            .tick(t(0))
            .outbound
            .iter()
            .all(|o| !matches!(o, Outbound::SaveSnapshot(_))));
    }

    #[test]
    fn test_restore_from_store() {
        let store = MemoryStore::new();
        let mut state = SessionState::new();
        state.last_lap_completed = 20;
        state.buffer_frozen = false;
        state.derived.fuel_avg3 = Some(3.0);
        store
            .set(SNAPSHOT_KEY, &crate::store::encode_snapshot(&state).unwrap(), t(0))
            .unwrap();

        let engine = Engine::restore(InstanceId::new("a"), &config(), &store, t(60));
        assert_eq!(engine.state().last_lap_completed, 20);
        assert_eq!(engine.metrics().display.fuel_avg3, Some(Liters(3.0)));
    }

    #[test]
    fn test_initial_state_for_someone_else_is_ignored() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        let mut other = SessionState::new();
        other.last_lap_completed = 5;
        let update = engine.handle_peer(
            PeerMessage::InitialState {
                to: InstanceId::new("b"),
                payload: Some(other.to_patch()),
            },
            t(0),
        );
        assert!(update.is_empty());
        assert_eq!(engine.state().last_lap_completed, -1);
    }

    #[test]
    fn test_session_info_seeds_tank_capacity() {
        let mut engine = Engine::new(InstanceId::new("a"), &config());
        engine.ingest_session_info(&SessionInfo {
            fuel_capacity_liters: Some(120.0),
            max_fuel_pct: Some(0.9),
            ..Default::default()
        });
        engine.ingest_sample(sample(true, 0, 100.0, 0));
        engine.ingest_sample(sample(true, 1, 100.0, 90));
        // 108 - 100
        assert_eq!(engine.state().fuel_usage_history.latest(), Some(8.0));
    }
}
