//! Session state owned by one engine instance and replicated to peers

use crate::history::History;
use crate::sample::{Sample, TireWear};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FUEL_HISTORY_LEN: usize = 5;
pub const LAP_TIME_HISTORY_LEN: usize = 5;
pub const STINT_HISTORY_LEN: usize = 10;

/// Buffer gate phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatePhase {
    #[default]
    NoDriver,
    Settling,
    Live,
}

/// Rolling averages and fuel-range projection, recomputed every lap
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Derived {
    pub fuel_avg3: Option<f64>,
    pub fuel_avg5: Option<f64>,
    pub lap_avg3: Option<f64>,
    pub lap_avg5: Option<f64>,
    pub projected_laps: Option<f64>,
    pub projected_time: Option<f64>,
}

/// Which detector closed a stint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundarySource {
    PitRoad,
    TrackOccupancy,
}

/// Finalized summary of one stint, consumed by strategy planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StintSummary {
    pub source: BoundarySource,
    pub ended_at: DateTime<Utc>,
    pub lap_count: Option<i32>,
    pub duration: Option<f64>,
    pub fuel_used: Option<f64>,
    pub avg_fuel_per_lap: Option<f64>,
    pub avg_lap_time: Option<f64>,
    pub incidents: u32,
    pub tire_wear: Option<TireWear>,
}

/// Accumulating bookkeeping for the stint in progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StintState {
    /// `SessionTimeRemain` when the stint began (counts down)
    pub start_session_time: Option<f64>,
    pub start_lap: Option<i32>,
    pub start_fuel: Option<f64>,
    pub was_on_pit_road: bool,
    /// `SessionTimeRemain` at pit entry, for measuring the stop
    pub pit_entry_session_time: Option<f64>,
    /// Wall clock at driver entry
    pub started_at: Option<DateTime<Utc>>,
    /// Accepted pit-stop durations (seconds)
    pub duration_history: History<STINT_HISTORY_LEN>,
    /// Accepted stint lengths (laps)
    pub lap_count_history: History<STINT_HISTORY_LEN>,
    pub last_tire_wear_snapshot: Option<TireWear>,
    pub last_summary: Option<StintSummary>,
}

/// Everything one engine instance derives from its sample stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    // Buffer gate
    pub gate_phase: GatePhase,
    pub buffer_frozen: bool,
    pub lap_entry_point: Option<i32>,
    pub last_observed_lap: Option<i32>,

    // Lap pipeline
    pub fuel_at_lap_start: Option<f64>,
    pub fuel_usage_history: History<FUEL_HISTORY_LEN>,
    pub lap_time_history: History<LAP_TIME_HISTORY_LEN>,
    pub last_lap_completed: i32,
    pub last_lap_at: Option<DateTime<Utc>>,
    pub derived: Derived,

    // Stint tracker
    pub stint: StintState,
    pub incident_count_at_stint_start: u32,

    /// Most recent sample accepted while live. Local only: never replicated
    /// or persisted.
    #[serde(skip)]
    pub gated_sample: Option<Sample>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            gate_phase: GatePhase::NoDriver,
            buffer_frozen: true,
            lap_entry_point: None,
            last_observed_lap: None,
            fuel_at_lap_start: None,
            fuel_usage_history: History::new(),
            lap_time_history: History::new(),
            last_lap_completed: -1,
            last_lap_at: None,
            derived: Derived::default(),
            stint: StintState::default(),
            incident_count_at_stint_start: 0,
            gated_sample: None,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full patch of every replicated field
    pub fn to_patch(&self) -> StatePatch {
        StatePatch {
            gate_phase: Some(self.gate_phase),
            buffer_frozen: Some(self.buffer_frozen),
            lap_entry_point: Some(self.lap_entry_point),
            last_observed_lap: Some(self.last_observed_lap),
            fuel_at_lap_start: Some(self.fuel_at_lap_start),
            fuel_usage_history: Some(self.fuel_usage_history.clone()),
            lap_time_history: Some(self.lap_time_history.clone()),
            last_lap_completed: Some(self.last_lap_completed),
            last_lap_at: Some(self.last_lap_at),
            derived: Some(self.derived),
            stint: Some(self.stint.clone()),
            incident_count_at_stint_start: Some(self.incident_count_at_stint_start),
        }
    }

    /// Overwrite every field present in `patch`; absent fields are untouched
    pub fn apply_patch(&mut self, patch: StatePatch) {
        if let Some(v) = patch.gate_phase {
            self.gate_phase = v;
        }
        if let Some(v) = patch.buffer_frozen {
            self.buffer_frozen = v;
        }
        if let Some(v) = patch.lap_entry_point {
            self.lap_entry_point = v;
        }
        if let Some(v) = patch.last_observed_lap {
            self.last_observed_lap = v;
        }
        if let Some(v) = patch.fuel_at_lap_start {
            self.fuel_at_lap_start = v;
        }
        if let Some(v) = patch.fuel_usage_history {
            self.fuel_usage_history = v;
        }
        if let Some(v) = patch.lap_time_history {
            self.lap_time_history = v;
        }
        if let Some(v) = patch.last_lap_completed {
            self.last_lap_completed = v;
        }
        if let Some(v) = patch.last_lap_at {
            self.last_lap_at = v;
        }
        if let Some(v) = patch.derived {
            self.derived = v;
        }
        if let Some(v) = patch.stint {
            self.stint = v;
        }
        if let Some(v) = patch.incident_count_at_stint_start {
            self.incident_count_at_stint_start = v;
        }
    }
}

/// Partial [`SessionState`]: each present field replaces the local one.
///
/// Nullable state fields are doubly optional here: the outer `Option` says
/// whether the field is carried, the inner one is the value itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_phase: Option<GatePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_frozen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "carried")]
    pub lap_entry_point: Option<Option<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "carried")]
    pub last_observed_lap: Option<Option<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "carried")]
    pub fuel_at_lap_start: Option<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_usage_history: Option<History<FUEL_HISTORY_LEN>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lap_time_history: Option<History<LAP_TIME_HISTORY_LEN>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_lap_completed: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "carried")]
    pub last_lap_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived: Option<Derived>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stint: Option<StintState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_count_at_stint_start: Option<u32>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        *self == StatePatch::default()
    }
}

/// Keeps `Some(None)` distinct from an absent field: a carried field
/// serializes as its inner value (possibly `null`), and any value present
/// on the wire, `null` included, deserializes as carried.
mod carried {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, s: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(d: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(d).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_empty() {
        let state = SessionState::new();
        assert_eq!(state.gate_phase, GatePhase::NoDriver);
        assert!(state.buffer_frozen);
        assert_eq!(state.last_lap_completed, -1);
        assert!(state.fuel_usage_history.is_empty());
        assert!(state.gated_sample.is_none());
    }

    #[test]
    fn test_full_patch_round_trips_through_json() {
        let mut state = SessionState::new();
        state.last_lap_completed = 7;
        state.fuel_at_lap_start = Some(88.0);
        state.fuel_usage_history.push_prefilled(2.5, 3);
        state.derived.fuel_avg3 = Some(2.5);

        let json = serde_json::to_string(&state.to_patch()).unwrap();
        let patch: StatePatch = serde_json::from_str(&json).unwrap();

        let mut replica = SessionState::new();
        replica.apply_patch(patch);
        assert_eq!(replica, state);
    }

    #[test]
    fn test_carried_null_clears_field() {
        let mut state = SessionState::new();
        state.fuel_at_lap_start = Some(50.0);
        state.lap_entry_point = Some(3);

        let patch: StatePatch =
            serde_json::from_str(r#"{ "fuel_at_lap_start": null }"#).unwrap();
        state.apply_patch(patch);

        assert_eq!(state.fuel_at_lap_start, None, "explicit null is carried");
        assert_eq!(state.lap_entry_point, Some(3), "absent field is untouched");
    }

    #[test]
    fn test_gated_sample_is_not_serialized() {
        let mut state = SessionState::new();
        state.gated_sample = Some(crate::sample::Sample::normalize(
            &Default::default(),
            Utc::now(),
        ));
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("gated_sample").is_none());
    }
}
