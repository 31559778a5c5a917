//! Engine tuning constants
//!
//! All fields have defaults so a partial JSON document (or none at all) is a
//! valid configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tank capacity used until session info reports the real one
    pub tank_capacity_liters: f64,

    /// Full laps after driver entry before derived values go live
    pub settle_laps: i32,

    /// Floor for the synthesized fuel usage when no lap-start baseline exists
    pub min_estimated_usage: f64,

    /// Periodic state publish interval
    pub publish_interval_secs: f64,

    /// Periodic snapshot save interval
    pub save_interval_secs: f64,

    /// How long the anti-echo guard stays up after applying remote state
    pub apply_guard_ms: i64,

    /// Persisted snapshots older than this are ignored
    pub snapshot_retention_secs: i64,

    /// Pit stops shorter than this are treated as pit-road flag flicker
    pub pit_stop_min_secs: f64,

    /// Pit stops longer than this are treated as garbage
    pub pit_stop_max_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tank_capacity_liters: 100.0,
            settle_laps: 2,
            min_estimated_usage: 0.5,
            publish_interval_secs: 5.0,
            save_interval_secs: 5.0,
            apply_guard_ms: 250,
            snapshot_retention_secs: 6 * 60 * 60,
            pit_stop_min_secs: 10.0,
            pit_stop_max_secs: 300.0,
        }
    }
}

impl EngineConfig {
    pub fn publish_interval(&self) -> Duration {
        secs_to_duration(self.publish_interval_secs)
    }

    pub fn save_interval(&self) -> Duration {
        secs_to_duration(self.save_interval_secs)
    }

    pub fn apply_guard(&self) -> Duration {
        Duration::milliseconds(self.apply_guard_ms.max(0))
    }

    pub fn snapshot_retention(&self) -> Duration {
        Duration::seconds(self.snapshot_retention_secs.max(0))
    }

    /// Whether a measured pit-stop duration is plausible
    pub fn pit_stop_in_window(&self, secs: f64) -> bool {
        secs > self.pit_stop_min_secs && secs < self.pit_stop_max_secs
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs.max(0.0) * 1000.0).round() as i64)
}
