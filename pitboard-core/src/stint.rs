//! Stint tracker
//!
//! Two detectors close stints:
//!
//! - **pit road**: `OnPitRoad` edges. Entry ends the stint and measures it
//!   against the session clock; exit measures the stop itself and starts the
//!   next stint.
//! - **track occupancy**: the buffer gate's driver entry/exit. Exit summarizes
//!   the stint from the lap histories and the wall clock.
//!
//! Both emit [`StintBoundaryEvent`]s into one sink, [`StintTracker::record`],
//! which owns every write to the stint summary fields. When both fire close
//! together the later one's summary is the one kept.

use crate::config::EngineConfig;
use crate::sample::{Sample, TireWear};
use crate::state::{BoundarySource, SessionState, StintSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// What a detector measured when a stint ended
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StintMeasurement {
    pub lap_count: Option<i32>,
    pub duration: Option<f64>,
    pub fuel_used: Option<f64>,
    pub avg_fuel_per_lap: Option<f64>,
    pub avg_lap_time: Option<f64>,
    pub incidents: u32,
    pub tire_wear: Option<TireWear>,
}

impl StintMeasurement {
    fn is_empty(&self) -> bool {
        self.lap_count.is_none() && self.duration.is_none() && self.fuel_used.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StintBoundary {
    Start,
    End(StintMeasurement),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StintBoundaryEvent {
    pub source: BoundarySource,
    pub at: DateTime<Utc>,
    pub boundary: StintBoundary,
}

/// Time spent on pit road between entry and exit
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PitStop {
    Recorded(f64),
    /// Outside the sanity window, e.g. pit-road flag flicker
    Discarded(f64),
    /// Entry time unknown (engine started while on pit road)
    Unmeasured,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PitRoadEdge {
    Entered(StintBoundaryEvent),
    Exited {
        stop: PitStop,
        boundary: StintBoundaryEvent,
    },
}

/// Running figures for the stint in progress
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StintProgress {
    pub laps: Option<i32>,
    pub fuel_used: Option<f64>,
    pub elapsed: Option<f64>,
    pub incidents: u32,
}

pub struct StintTracker {
    config: EngineConfig,
}

impl StintTracker {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Pit-road detector. Runs on every sample, gated or not.
    pub fn observe_pit_road(&self, state: &mut SessionState, sample: &Sample) -> Option<PitRoadEdge> {
        let was = state.stint.was_on_pit_road;
        state.stint.was_on_pit_road = sample.on_pit_road;

        match (was, sample.on_pit_road) {
            (false, true) => {
                let event = self.pit_entry(state, sample);
                self.record(state, &event);
                Some(PitRoadEdge::Entered(event))
            }
            (true, false) => {
                let stop = self.pit_exit(state, sample);
                let event = StintBoundaryEvent {
                    source: BoundarySource::PitRoad,
                    at: sample.timestamp,
                    boundary: StintBoundary::Start,
                };
                self.record(state, &event);
                Some(PitRoadEdge::Exited {
                    stop,
                    boundary: event,
                })
            }
            _ => None,
        }
    }

    fn pit_entry(&self, state: &mut SessionState, sample: &Sample) -> StintBoundaryEvent {
        let stint = &mut state.stint;
        let lap = sample.lap_completed.or(state.last_observed_lap);

        let duration = stint
            .start_session_time
            .map(|start| start - sample.session_time_remain)
            .filter(|d| *d > 0.0);
        let lap_count = stint
            .start_lap
            .zip(lap)
            .map(|(start, now)| now.saturating_sub(start))
            .filter(|n| *n > 0);
        let fuel_used = stint
            .start_fuel
            .map(|start| start - sample.fuel_level)
            .filter(|f| *f > 0.0);

        stint.pit_entry_session_time = Some(sample.session_time_remain);

        let measurement = StintMeasurement {
            lap_count,
            duration,
            fuel_used,
            avg_fuel_per_lap: per_lap(fuel_used, lap_count),
            avg_lap_time: per_lap(duration, lap_count),
            incidents: sample
                .incident_count
                .saturating_sub(state.incident_count_at_stint_start),
            // Taken before the stop starts changing tires
            tire_wear: non_empty(sample.tire_wear),
        };

        StintBoundaryEvent {
            source: BoundarySource::PitRoad,
            at: sample.timestamp,
            boundary: StintBoundary::End(measurement),
        }
    }

    fn pit_exit(&self, state: &mut SessionState, sample: &Sample) -> PitStop {
        let stint = &mut state.stint;
        let stop = match stint.pit_entry_session_time.take() {
            Some(entry) => {
                let secs = entry - sample.session_time_remain;
                if self.config.pit_stop_in_window(secs) {
                    stint.duration_history.push(secs);
                    PitStop::Recorded(secs)
                } else {
                    debug!(secs, "discarding pit stop outside sanity window");
                    PitStop::Discarded(secs)
                }
            }
            None => PitStop::Unmeasured,
        };

        stint.start_session_time = Some(sample.session_time_remain);
        stint.start_lap = sample.lap_completed.or(state.last_observed_lap);
        stint.start_fuel = Some(sample.fuel_level);
        state.incident_count_at_stint_start = sample.incident_count;
        stop
    }

    /// Track-occupancy detector: driver got in the car
    pub fn driver_entered(&self, state: &mut SessionState, sample: &Sample) -> StintBoundaryEvent {
        state.stint.started_at = Some(sample.timestamp);
        state.incident_count_at_stint_start = sample.incident_count;

        let event = StintBoundaryEvent {
            source: BoundarySource::TrackOccupancy,
            at: sample.timestamp,
            boundary: StintBoundary::Start,
        };
        self.record(state, &event);
        event
    }

    /// Track-occupancy detector: driver left the car. `last_gated` is the
    /// most recent live sample, `now` the exit time.
    pub fn driver_exited(
        &self,
        state: &mut SessionState,
        lap: i32,
        last_gated: &Sample,
        now: DateTime<Utc>,
    ) -> StintBoundaryEvent {
        let lap_count = state
            .lap_entry_point
            .map(|entry| lap.saturating_sub(entry))
            .filter(|n| *n > 0);
        let avg_fuel_per_lap = state.fuel_usage_history.mean();
        let duration = state
            .stint
            .started_at
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0)
            .filter(|d| *d > 0.0);

        let measurement = StintMeasurement {
            lap_count,
            duration,
            fuel_used: avg_fuel_per_lap
                .zip(lap_count)
                .map(|(avg, laps)| avg * f64::from(laps)),
            avg_fuel_per_lap,
            avg_lap_time: state.lap_time_history.mean(),
            incidents: last_gated
                .incident_count
                .saturating_sub(state.incident_count_at_stint_start),
            tire_wear: non_empty(last_gated.tire_wear),
        };

        let event = StintBoundaryEvent {
            source: BoundarySource::TrackOccupancy,
            at: now,
            boundary: StintBoundary::End(measurement),
        };
        self.record(state, &event);
        event
    }

    /// Common sink for both detectors
    pub fn record(&self, state: &mut SessionState, event: &StintBoundaryEvent) {
        let StintBoundary::End(m) = &event.boundary else {
            return;
        };

        // A driver leaving the car mid-stop: pit entry already counted this stint
        let counted_at_pit_entry = event.source == BoundarySource::TrackOccupancy
            && state.stint.pit_entry_session_time.is_some();
        if let Some(laps) = m.lap_count.filter(|_| !counted_at_pit_entry) {
            state.stint.lap_count_history.push(f64::from(laps));
        }
        if m.tire_wear.is_some() {
            state.stint.last_tire_wear_snapshot = m.tire_wear;
        }
        if m.is_empty() {
            return;
        }
        state.stint.last_summary = Some(StintSummary {
            source: event.source,
            ended_at: event.at,
            lap_count: m.lap_count,
            duration: m.duration,
            fuel_used: m.fuel_used,
            avg_fuel_per_lap: m.avg_fuel_per_lap,
            avg_lap_time: m.avg_lap_time,
            incidents: m.incidents,
            tire_wear: m.tire_wear,
        });
    }

    /// Figures for the stint in progress as of `sample`
    pub fn progress(&self, state: &SessionState, sample: &Sample) -> StintProgress {
        let stint = &state.stint;
        StintProgress {
            laps: stint
                .start_lap
                .zip(sample.lap_completed.or(state.last_observed_lap))
                .map(|(start, now)| now.saturating_sub(start).max(0)),
            fuel_used: stint.start_fuel.map(|start| (start - sample.fuel_level).max(0.0)),
            elapsed: stint
                .start_session_time
                .map(|start| (start - sample.session_time_remain).max(0.0)),
            incidents: sample
                .incident_count
                .saturating_sub(state.incident_count_at_stint_start),
        }
    }
}

fn per_lap(total: Option<f64>, laps: Option<i32>) -> Option<f64> {
    total.zip(laps).map(|(t, n)| t / f64::from(n))
}

fn non_empty(wear: TireWear) -> Option<TireWear> {
    (!wear.is_empty()).then_some(wear)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{RawSample, TreadWear};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 14, 0, 0).unwrap()
    }

    fn sample(pit: bool, lap: i32, fuel: f64, remain: f64) -> Sample {
        let mut s = Sample::normalize(&RawSample::new(), t0() + Duration::seconds((7200.0 - remain) as i64));
        s.on_track = true;
        s.on_pit_road = pit;
        s.lap_completed = Some(lap);
        s.fuel_level = fuel;
        s.session_time_remain = remain;
        s
    }

    fn tracker() -> StintTracker {
        StintTracker::new(&EngineConfig::default())
    }

    #[test]
    fn test_pit_cycle_measures_stint_and_stop() {
        let tracker = tracker();
        let mut state = SessionState::new();

        // Leave the pits to start the stint
        tracker.observe_pit_road(&mut state, &sample(true, 0, 104.0, 7200.0));
        let edge = tracker.observe_pit_road(&mut state, &sample(false, 0, 104.0, 7180.0));
        assert!(matches!(edge, Some(PitRoadEdge::Exited { stop: PitStop::Recorded(s), .. }) if s == 20.0));
        assert_eq!(state.stint.start_lap, Some(0));
        assert!(state.stint.last_summary.is_none(), "nothing to summarize yet");

        // 10 laps later, come back in
        let mut entry = sample(true, 10, 74.0, 6280.0);
        entry.tire_wear.left_front = Some(TreadWear { left: 0.8, middle: 0.82, right: 0.85 });
        let edge = tracker.observe_pit_road(&mut state, &entry);
        let Some(PitRoadEdge::Entered(event)) = edge else {
            panic!("expected pit entry, got {:?}", edge);
        };
        let StintBoundary::End(m) = event.boundary else {
            panic!("expected stint end");
        };
        assert_eq!(m.lap_count, Some(10));
        assert_eq!(m.duration, Some(900.0));
        assert_eq!(m.fuel_used, Some(30.0));
        assert_eq!(m.avg_fuel_per_lap, Some(3.0));
        assert_eq!(m.avg_lap_time, Some(90.0));
        assert!(state.stint.last_tire_wear_snapshot.is_some());
        assert_eq!(state.stint.lap_count_history.latest(), Some(10.0));

        // 42 seconds stationary
        let edge = tracker.observe_pit_road(&mut state, &sample(false, 10, 104.0, 6238.0));
        assert!(matches!(edge, Some(PitRoadEdge::Exited { stop: PitStop::Recorded(s), .. }) if s == 42.0));
        assert_eq!(state.stint.duration_history.latest(), Some(42.0));
        assert_eq!(state.stint.start_fuel, Some(104.0));

        let summary = state.stint.last_summary.as_ref().unwrap();
        assert_eq!(summary.source, BoundarySource::PitRoad);
        assert_eq!(summary.lap_count, Some(10));
    }

    #[test]
    fn test_pit_flag_flicker_is_discarded() {
        let tracker = tracker();
        let mut state = SessionState::new();
        tracker.observe_pit_road(&mut state, &sample(true, 5, 80.0, 5000.0));
        let edge = tracker.observe_pit_road(&mut state, &sample(false, 5, 80.0, 4997.0));
        assert!(matches!(edge, Some(PitRoadEdge::Exited { stop: PitStop::Discarded(s), .. }) if s == 3.0));
        assert!(state.stint.duration_history.is_empty());
    }

    #[test]
    fn test_no_edge_no_change() {
        let tracker = tracker();
        let mut state = SessionState::new();
        assert!(tracker.observe_pit_road(&mut state, &sample(false, 1, 80.0, 5000.0)).is_none());
        assert!(tracker.observe_pit_road(&mut state, &sample(false, 2, 77.0, 4910.0)).is_none());
    }

    #[test]
    fn test_occupancy_exit_summarizes_from_histories() {
        let tracker = tracker();
        let mut state = SessionState::new();
        state.lap_entry_point = Some(3);
        let mut entry = sample(false, 3, 90.0, 6000.0);
        entry.incident_count = 2;
        tracker.driver_entered(&mut state, &entry);
        assert_eq!(state.incident_count_at_stint_start, 2);

        state.fuel_usage_history.push_prefilled(3.0, 3);
        state.lap_time_history.push_prefilled(92.0, 3);

        let mut gated = sample(false, 9, 72.0, 5448.0);
        gated.incident_count = 6;
        let now = entry.timestamp + Duration::seconds(560);
        let event = tracker.driver_exited(&mut state, 9, &gated, now);

        let StintBoundary::End(m) = event.boundary else {
            panic!("expected stint end");
        };
        assert_eq!(m.lap_count, Some(6));
        assert_eq!(m.avg_fuel_per_lap, Some(3.0));
        assert_eq!(m.fuel_used, Some(18.0));
        assert_eq!(m.avg_lap_time, Some(92.0));
        assert_eq!(m.duration, Some(560.0));
        assert_eq!(m.incidents, 4);

        let summary = state.stint.last_summary.as_ref().unwrap();
        assert_eq!(summary.source, BoundarySource::TrackOccupancy);
        assert!(state.stint.duration_history.is_empty(), "stint length is not a pit stop");
    }

    #[test]
    fn test_driver_swap_in_pits_counts_stint_once() {
        let tracker = tracker();
        let mut state = SessionState::new();
        tracker.observe_pit_road(&mut state, &sample(true, 0, 104.0, 7200.0));
        tracker.observe_pit_road(&mut state, &sample(false, 0, 104.0, 7180.0));
        state.lap_entry_point = Some(0);
        tracker.driver_entered(&mut state, &sample(false, 0, 104.0, 7180.0));

        // Twelve laps, pit in, driver climbs out on pit road
        let entry = sample(true, 12, 68.0, 6100.0);
        tracker.observe_pit_road(&mut state, &entry);
        assert_eq!(state.stint.lap_count_history.len(), 1);

        let now = entry.timestamp + Duration::seconds(15);
        tracker.driver_exited(&mut state, 12, &entry, now);
        assert_eq!(state.stint.lap_count_history.iter().collect::<Vec<_>>(), vec![12.0]);
        assert_eq!(
            state.stint.last_summary.as_ref().unwrap().source,
            BoundarySource::TrackOccupancy
        );
    }

    #[test]
    fn test_progress() {
        let tracker = tracker();
        let mut state = SessionState::new();
        tracker.observe_pit_road(&mut state, &sample(true, 0, 104.0, 7200.0));
        tracker.observe_pit_road(&mut state, &sample(false, 0, 104.0, 7180.0));
        let p = tracker.progress(&state, &sample(false, 4, 92.0, 6820.0));
        assert_eq!(p.laps, Some(4));
        assert_eq!(p.fuel_used, Some(12.0));
        assert_eq!(p.elapsed, Some(360.0));
    }
}
