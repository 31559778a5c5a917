//! Sample normalization
//!
//! Telemetry arrives as loosely typed key→value maps named after the iRacing
//! telemetry variables. [`Sample::normalize`] turns one of those into the
//! handful of typed fields the engine reads, defaulting anything missing or
//! malformed instead of failing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw telemetry sample as delivered by a source
pub type RawSample = HashMap<String, serde_json::Value>;

pub const IS_ON_TRACK: &str = "IsOnTrack";
pub const ON_PIT_ROAD: &str = "OnPitRoad";
pub const LAP_COMPLETED: &str = "LapCompleted";
pub const LAP_DIST_PCT: &str = "LapDistPct";
pub const FUEL_LEVEL: &str = "FuelLevel";
pub const SESSION_TIME_REMAIN: &str = "SessionTimeRemain";
pub const LAP_LAST_LAP_TIME: &str = "LapLastLapTime";
pub const INCIDENT_COUNT: &str = "PlayerCarDriverIncidentCount";

/// Normalized telemetry observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// When the host received this sample
    pub timestamp: DateTime<Utc>,

    pub on_track: bool,
    pub on_pit_road: bool,

    /// Laps completed; `None` when absent or the source's invalid marker
    pub lap_completed: Option<i32>,

    /// Position around the lap, [0, 1)
    pub lap_dist_pct: f64,

    /// Fuel in the tank (liters)
    pub fuel_level: f64,

    /// Session clock counting down (seconds)
    pub session_time_remain: f64,

    /// Authoritative last lap time, only when positive
    pub last_lap_time: Option<f64>,

    pub incident_count: u32,

    pub tire_wear: TireWear,
}

impl Sample {
    /// Extract the engine's fields from a raw sample. Never fails.
    pub fn normalize(raw: &RawSample, received_at: DateTime<Utc>) -> Self {
        let lap_dist_pct = get_f64(raw, LAP_DIST_PCT)
            .filter(|v| (0.0..1.0).contains(v))
            .unwrap_or(0.0);

        Self {
            timestamp: received_at,
            on_track: get_bool(raw, IS_ON_TRACK).unwrap_or(false),
            on_pit_road: get_bool(raw, ON_PIT_ROAD).unwrap_or(false),
            lap_completed: get_i64(raw, LAP_COMPLETED)
                .filter(|lap| *lap >= 0)
                .and_then(|lap| i32::try_from(lap).ok()),
            lap_dist_pct,
            fuel_level: non_negative(get_f64(raw, FUEL_LEVEL)),
            session_time_remain: non_negative(get_f64(raw, SESSION_TIME_REMAIN)),
            last_lap_time: get_f64(raw, LAP_LAST_LAP_TIME).filter(|t| *t > 0.0),
            incident_count: get_i64(raw, INCIDENT_COUNT)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            tire_wear: TireWear::from_raw(raw),
        }
    }
}

fn non_negative(value: Option<f64>) -> f64 {
    value.filter(|v| *v >= 0.0).unwrap_or(0.0)
}

fn get_f64(raw: &RawSample, name: &str) -> Option<f64> {
    let value = match raw.get(name)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

fn get_i64(raw: &RawSample, name: &str) -> Option<i64> {
    match raw.get(name)? {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        _ => None,
    }
}

fn get_bool(raw: &RawSample, name: &str) -> Option<bool> {
    match raw.get(name)? {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    }
}

/// Tire corner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Corner {
    LeftFront,
    RightFront,
    LeftRear,
    RightRear,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::LeftFront,
        Corner::RightFront,
        Corner::LeftRear,
        Corner::RightRear,
    ];

    /// Telemetry variable prefix, e.g. `LF` in `LFwearM`
    pub fn prefix(&self) -> &'static str {
        match self {
            Corner::LeftFront => "LF",
            Corner::RightFront => "RF",
            Corner::LeftRear => "LR",
            Corner::RightRear => "RR",
        }
    }
}

/// Remaining tread across one tire, left/middle/right (1.0 = new)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreadWear {
    pub left: f64,
    pub middle: f64,
    pub right: f64,
}

impl TreadWear {
    pub fn average(&self) -> f64 {
        (self.left + self.middle + self.right) / 3.0
    }

    /// Most worn strip
    pub fn min(&self) -> f64 {
        self.left.min(self.middle).min(self.right)
    }
}

/// Per-corner tread wear
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TireWear {
    pub left_front: Option<TreadWear>,
    pub right_front: Option<TreadWear>,
    pub left_rear: Option<TreadWear>,
    pub right_rear: Option<TreadWear>,
}

impl TireWear {
    /// Corners are present only when all three strips are reported
    pub fn from_raw(raw: &RawSample) -> Self {
        let read = |corner: Corner| -> Option<TreadWear> {
            let strip = |side: &str| {
                get_f64(raw, &format!("{}wear{}", corner.prefix(), side)).map(|v| v.clamp(0.0, 1.0))
            };
            Some(TreadWear {
                left: strip("L")?,
                middle: strip("M")?,
                right: strip("R")?,
            })
        };

        Self {
            left_front: read(Corner::LeftFront),
            right_front: read(Corner::RightFront),
            left_rear: read(Corner::LeftRear),
            right_rear: read(Corner::RightRear),
        }
    }

    pub fn corner(&self, corner: Corner) -> Option<&TreadWear> {
        match corner {
            Corner::LeftFront => self.left_front.as_ref(),
            Corner::RightFront => self.right_front.as_ref(),
            Corner::LeftRear => self.left_rear.as_ref(),
            Corner::RightRear => self.right_rear.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        Corner::ALL.iter().all(|c| self.corner(*c).is_none())
    }
}

/// Session-level facts pushed on the metadata channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    pub track_name: Option<String>,
    pub track_length_km: Option<f64>,
    pub session_duration_secs: Option<f64>,
    pub fuel_capacity_liters: Option<f64>,
    /// Fraction of the physical tank the series allows
    pub max_fuel_pct: Option<f64>,
    pub drivers: Vec<DriverEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverEntry {
    pub name: String,
    #[serde(default)]
    pub car_number: Option<String>,
}

impl SessionInfo {
    /// Usable tank volume, when the session reports one
    pub fn tank_capacity(&self) -> Option<f64> {
        let capacity = self.fuel_capacity_liters.filter(|c| c.is_finite() && *c > 0.0)?;
        let pct = self
            .max_fuel_pct
            .filter(|p| p.is_finite() && *p > 0.0 && *p <= 1.0)
            .unwrap_or(1.0);
        Some(capacity * pct)
    }
}
