//! Dashboard-facing metrics record
//!
//! Built on demand from engine state. Quantities are wrapped in unit types so
//! they serialize rounded; the state they come from keeps full precision.

use crate::replicator::InstanceId;
use crate::sample::TireWear;
use crate::state::{Derived, GatePhase, StintSummary};
use crate::units::{Laps, Liters, Seconds};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub instance: InstanceId,
    pub updated_at: Option<DateTime<Utc>>,
    pub gate: GateStatus,
    pub last_lap_completed: Option<i32>,
    /// Fuel in the last gated sample
    pub fuel_level: Option<Liters>,
    /// Derived block as of the latest lap, frozen or not
    pub live: DerivedMetrics,
    /// Derived block as of the last lap completed while live
    pub display: DerivedMetrics,
    pub stint: StintReport,
    pub persistence_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateStatus {
    pub phase: GatePhase,
    pub buffer_frozen: bool,
    pub lap_entry_point: Option<i32>,
    /// Laps still to complete before going live, while settling
    pub laps_until_live: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub fuel_avg3: Option<Liters>,
    pub fuel_avg5: Option<Liters>,
    pub lap_avg3: Option<Seconds>,
    pub lap_avg5: Option<Seconds>,
    pub projected_laps: Option<Laps>,
    pub projected_time: Option<Seconds>,
    /// `lap_avg3` as `m:ss.mmm`
    pub lap_avg3_text: Option<String>,
}

impl From<&Derived> for DerivedMetrics {
    fn from(d: &Derived) -> Self {
        let lap_avg3 = d.lap_avg3.map(Seconds);
        Self {
            fuel_avg3: d.fuel_avg3.map(Liters),
            fuel_avg5: d.fuel_avg5.map(Liters),
            lap_avg3,
            lap_avg5: d.lap_avg5.map(Seconds),
            projected_laps: d.projected_laps.map(Laps),
            projected_time: d.projected_time.map(Seconds),
            lap_avg3_text: lap_avg3.map(|s| s.as_lap_time()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StintReport {
    // Stint in progress
    pub laps: Option<i32>,
    pub fuel_used: Option<Liters>,
    pub elapsed: Option<Seconds>,
    pub incidents: u32,

    // History
    pub pit_stops_recorded: usize,
    pub avg_pit_stop: Option<Seconds>,
    pub avg_stint_laps: Option<Laps>,
    pub last_tire_wear: Option<TireWear>,
    pub last_summary: Option<StintSummary>,
}
