//! Lap pipeline
//!
//! Fires once per distinct increase of `LapCompleted` and turns it into a
//! fuel-usage and lap-time observation, rolling averages, and a fuel range
//! projection.

use crate::sample::Sample;
use crate::state::{Derived, SessionState};
use tracing::debug;

/// Copies written for the first value of an empty history
const PREFILL_COPIES: usize = 3;

/// How a lap's fuel usage was obtained
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FuelObservation {
    /// Baseline minus current fuel
    Measured(f64),
    /// No baseline existed; synthesized from tank capacity
    Estimated(f64),
    /// Negative or non-finite (refuel mid-lap, glitch); not stored
    Rejected(f64),
}

impl FuelObservation {
    pub fn accepted(&self) -> Option<f64> {
        match self {
            FuelObservation::Measured(v) | FuelObservation::Estimated(v) => Some(*v),
            FuelObservation::Rejected(_) => None,
        }
    }
}

/// One processed lap-completion event
#[derive(Debug, Clone, PartialEq)]
pub struct LapCompletion {
    pub lap: i32,
    pub lap_time: Option<f64>,
    pub fuel: FuelObservation,
    pub derived: Derived,
}

pub struct LapPipeline {
    tank_capacity: f64,
    min_estimated_usage: f64,
}

impl LapPipeline {
    pub fn new(tank_capacity: f64, min_estimated_usage: f64) -> Self {
        Self {
            tank_capacity,
            min_estimated_usage,
        }
    }

    pub fn tank_capacity(&self) -> f64 {
        self.tank_capacity
    }

    pub fn set_tank_capacity(&mut self, liters: f64) {
        if liters.is_finite() && liters > 0.0 {
            self.tank_capacity = liters;
        }
    }

    /// Process a sample; returns `Some` only on a new lap completion.
    ///
    /// Lap 0 means nothing has been completed yet and is not an event. Values
    /// at or below the last processed lap are duplicates or stale ticks.
    pub fn observe(&self, state: &mut SessionState, sample: &Sample) -> Option<LapCompletion> {
        let lap = sample.lap_completed?;
        if lap <= 0 || lap <= state.last_lap_completed {
            return None;
        }

        let lap_time = self.lap_time(state, sample);
        let fuel = self.fuel_usage(state, sample.fuel_level);

        if let Some(used) = fuel.accepted() {
            state.fuel_usage_history.push_prefilled(used, PREFILL_COPIES);
        } else {
            debug!(lap, fuel = ?fuel, "dropping fuel usage");
        }
        if let Some(t) = lap_time {
            state.lap_time_history.push_prefilled(t, PREFILL_COPIES);
        }

        state.derived = derive(state, sample.fuel_level);
        state.fuel_at_lap_start = Some(sample.fuel_level);
        state.last_lap_completed = lap;
        state.last_lap_at = Some(sample.timestamp);

        Some(LapCompletion {
            lap,
            lap_time,
            fuel,
            derived: state.derived,
        })
    }

    fn lap_time(&self, state: &SessionState, sample: &Sample) -> Option<f64> {
        if let Some(t) = sample.last_lap_time.filter(|t| t.is_finite() && *t > 0.0) {
            return Some(t);
        }
        let previous = state.last_lap_at?;
        let elapsed = (sample.timestamp - previous).num_milliseconds() as f64 / 1000.0;
        (elapsed > 0.0).then_some(elapsed)
    }

    fn fuel_usage(&self, state: &SessionState, fuel: f64) -> FuelObservation {
        match state.fuel_at_lap_start {
            Some(baseline) => {
                let used = baseline - fuel;
                if used.is_finite() && used >= 0.0 {
                    FuelObservation::Measured(used)
                } else {
                    FuelObservation::Rejected(used)
                }
            }
            None => {
                FuelObservation::Estimated((self.tank_capacity - fuel).max(self.min_estimated_usage))
            }
        }
    }
}

fn derive(state: &SessionState, current_fuel: f64) -> Derived {
    let fuel_avg3 = state.fuel_usage_history.mean_last(3);
    let lap_avg3 = state.lap_time_history.mean_last(3);

    let projected_laps = fuel_avg3
        .filter(|avg| *avg > 0.0)
        .map(|avg| current_fuel / avg);
    let projected_time = projected_laps.zip(lap_avg3).map(|(laps, avg)| laps * avg);

    Derived {
        fuel_avg3,
        fuel_avg5: state.fuel_usage_history.mean_last(5),
        lap_avg3,
        lap_avg5: state.lap_time_history.mean_last(5),
        projected_laps,
        projected_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::RawSample;
    use chrono::{Duration, TimeZone, Utc};

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 14, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn lap_sample(lap: i32, fuel: f64, secs: i64) -> Sample {
        let mut s = Sample::normalize(&RawSample::new(), at(secs));
        s.on_track = true;
        s.lap_completed = Some(lap);
        s.fuel_level = fuel;
        s
    }

    #[test]
    fn test_first_lap_without_baseline_is_estimated_and_prefilled() {
        let pipeline = LapPipeline::new(104.0, 0.5);
        let mut state = SessionState::new();

        let done = pipeline.observe(&mut state, &lap_sample(1, 101.0, 0)).unwrap();
        assert_eq!(done.fuel, FuelObservation::Estimated(3.0));
        assert_eq!(state.fuel_usage_history.iter().collect::<Vec<_>>(), vec![3.0; 3]);
        assert_eq!(state.derived.fuel_avg3, Some(3.0));
        assert_eq!(state.derived.fuel_avg5, None);
        assert_eq!(state.fuel_at_lap_start, Some(101.0));
        assert_eq!(done.lap_time, None, "no lap time source on the first lap");
    }

    #[test]
    fn test_estimate_has_a_floor() {
        let pipeline = LapPipeline::new(104.0, 0.5);
        let mut state = SessionState::new();
        let done = pipeline.observe(&mut state, &lap_sample(1, 104.0, 0)).unwrap();
        assert_eq!(done.fuel, FuelObservation::Estimated(0.5));
    }

    #[test]
    fn test_lap_time_falls_back_to_wall_clock() {
        let pipeline = LapPipeline::new(104.0, 0.5);
        let mut state = SessionState::new();
        pipeline.observe(&mut state, &lap_sample(1, 100.0, 0));
        let done = pipeline.observe(&mut state, &lap_sample(2, 97.0, 91)).unwrap();
        assert_eq!(done.lap_time, Some(91.0));
        assert_eq!(state.derived.lap_avg3, Some(91.0));
    }

    #[test]
    fn test_authoritative_lap_time_wins() {
        let pipeline = LapPipeline::new(104.0, 0.5);
        let mut state = SessionState::new();
        pipeline.observe(&mut state, &lap_sample(1, 100.0, 0));
        let mut s = lap_sample(2, 97.0, 91);
        s.last_lap_time = Some(90.25);
        let done = pipeline.observe(&mut state, &s).unwrap();
        assert_eq!(done.lap_time, Some(90.25));
    }

    #[test]
    fn test_refuel_mid_lap_is_rejected_but_baseline_advances() {
        let pipeline = LapPipeline::new(104.0, 0.5);
        let mut state = SessionState::new();
        pipeline.observe(&mut state, &lap_sample(1, 50.0, 0));
        let before = state.fuel_usage_history.clone();

        let done = pipeline.observe(&mut state, &lap_sample(2, 90.0, 90)).unwrap();
        assert_eq!(done.fuel, FuelObservation::Rejected(-40.0));
        assert_eq!(state.fuel_usage_history, before);
        assert_eq!(state.fuel_at_lap_start, Some(90.0));

        let done = pipeline.observe(&mut state, &lap_sample(3, 87.0, 180)).unwrap();
        assert_eq!(done.fuel, FuelObservation::Measured(3.0));
    }

    #[test]
    fn test_duplicate_stale_and_zero_laps_are_ignored() {
        let pipeline = LapPipeline::new(104.0, 0.5);
        let mut state = SessionState::new();
        assert!(pipeline.observe(&mut state, &lap_sample(0, 100.0, 0)).is_none());
        assert!(pipeline.observe(&mut state, &lap_sample(2, 100.0, 0)).is_some());
        assert!(pipeline.observe(&mut state, &lap_sample(2, 99.0, 5)).is_none());
        assert!(pipeline.observe(&mut state, &lap_sample(1, 98.0, 6)).is_none());
        assert_eq!(state.last_lap_completed, 2);
    }

    #[test]
    fn test_projection() {
        let pipeline = LapPipeline::new(104.0, 0.5);
        let mut state = SessionState::new();
        let mut s = lap_sample(1, 100.0, 0);
        s.last_lap_time = Some(90.0);
        pipeline.observe(&mut state, &s);
        let mut s = lap_sample(2, 96.0, 90);
        s.last_lap_time = Some(90.0);
        pipeline.observe(&mut state, &s);

        // usage history [4, 4, 4, 4]
        assert_eq!(state.derived.fuel_avg3, Some(4.0));
        assert_eq!(state.derived.projected_laps, Some(24.0));
        assert_eq!(state.derived.projected_time, Some(24.0 * 90.0));
    }

    #[test]
    fn test_tank_capacity_ignores_nonsense() {
        let mut pipeline = LapPipeline::new(104.0, 0.5);
        pipeline.set_tank_capacity(-1.0);
        pipeline.set_tank_capacity(f64::NAN);
        assert_eq!(pipeline.tank_capacity(), 104.0);
        pipeline.set_tank_capacity(120.0);
        assert_eq!(pipeline.tank_capacity(), 120.0);
    }
}
