//! Type-safe wrappers for the quantities shown on the dashboard
//!
//! Engine state keeps raw `f64` at full precision so replicas converge on
//! identical values. These newtypes only wrap values on the way out to
//! consumers, and serialize with 4 decimal places to keep payloads small.

use serde::{Deserialize, Serialize};

/// Round f64 to 4 decimal places for compact JSON serialization
fn round4<S: serde::Serializer>(val: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((*val * 10000.0).round() / 10000.0)
}

/// Liters (fuel volume)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Liters(#[serde(serialize_with = "round4")] pub f64);

/// Seconds (lap times, durations)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Seconds(#[serde(serialize_with = "round4")] pub f64);

impl Seconds {
    /// Format as `m:ss.mmm`, the way lap times are read on a pit wall
    pub fn as_lap_time(&self) -> String {
        let total_ms = (self.0.max(0.0) * 1000.0).round() as u64;
        let minutes = total_ms / 60_000;
        let seconds = (total_ms % 60_000) / 1000;
        let millis = total_ms % 1000;
        format!("{}:{:02}.{:03}", minutes, seconds, millis)
    }
}

/// Laps (fractional lap counts, e.g. projected range)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Laps(#[serde(serialize_with = "round4")] pub f64);
