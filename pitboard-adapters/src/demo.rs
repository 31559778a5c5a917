//! Demo source that simulates an endurance session for testing
//!
//! Laps a fictional circuit, burns fuel, wears tires, and pits every
//! [`LAPS_PER_STINT`] laps for fuel and tires. Every second stop is also a
//! driver swap: the car sits on pit road with nobody in it for a while.
//! Emits raw samples named after the iRacing telemetry variables, without
//! requiring an actual game.
//!
//! The simulation advances by a fixed step per sample, so a run is fully
//! deterministic.

use anyhow::Result;
use pitboard_core::adapter::SampleSource;
use pitboard_core::sample::{self, Corner, DriverEntry, RawSample, SessionInfo};
use serde_json::json;

const TRACK_NAME: &str = "Demo Endurance Ring";
const TRACK_LENGTH_KM: f64 = 5.2;
const SESSION_LENGTH_SECS: f64 = 6.0 * 60.0 * 60.0;

const TANK_LITERS: f64 = 104.0;
const BASE_LAP_SECS: f64 = 90.0;
const FUEL_PER_LAP: f64 = 2.9;

pub const LAPS_PER_STINT: i32 = 12;
pub const PIT_STOP_SECS: f64 = 40.0;
/// Time the car is empty during a driver swap
pub const DRIVER_SWAP_SECS: f64 = 20.0;

const DRIVERS: [&str; 2] = ["Alex Rivera", "Sam Chen"];

/// Per-lap tread loss, fronts then rears
const WEAR_PER_LAP: [f64; 4] = [0.009, 0.010, 0.006, 0.007];

/// Simple deterministic noise from a seed
fn noise(seed: f64) -> f64 {
    let x = (seed * 12.9898 + 78.233).sin() * 43_758.547;
    x - x.floor()
}

/// Small jitter centered around 0
fn jitter(seed: f64, amplitude: f64) -> f64 {
    (noise(seed) - 0.5) * 2.0 * amplitude
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Racing,
    PitLane {
        remaining: f64,
        swap: bool,
        serviced: bool,
    },
}

/// Left/middle/right tread for one corner
type Tread = [f64; 3];

struct Simulation {
    elapsed: f64,
    phase: Phase,
    laps_completed: i32,
    lap_progress: f64,
    lap_duration: f64,
    lap_started_at: f64,
    last_lap_time: f64,
    fuel: f64,
    fuel_rate: f64,
    incidents: i32,
    tread: [Tread; 4],
    stops: u32,
    driver: usize,
}

impl Simulation {
    fn new() -> Self {
        Self {
            elapsed: 0.0,
            phase: Phase::Racing,
            laps_completed: 0,
            lap_progress: 0.0,
            lap_duration: BASE_LAP_SECS,
            lap_started_at: 0.0,
            last_lap_time: 0.0,
            fuel: TANK_LITERS,
            fuel_rate: FUEL_PER_LAP,
            incidents: 0,
            tread: [[1.0; 3]; 4],
            stops: 0,
            driver: 0,
        }
    }

    fn advance(&mut self, step: f64) {
        self.elapsed += step;

        match self.phase {
            Phase::Racing => {
                self.lap_progress += step / self.lap_duration;
                self.fuel = (self.fuel - self.fuel_rate * step / self.lap_duration).max(0.0);
                if self.lap_progress >= 1.0 {
                    self.complete_lap();
                }
            }
            Phase::PitLane {
                remaining,
                swap,
                serviced,
            } => {
                let remaining = remaining - step;
                let mut serviced = serviced;
                if !serviced && remaining <= PIT_STOP_SECS / 2.0 {
                    self.service(swap);
                    serviced = true;
                }
                self.phase = if remaining <= 0.0 {
                    self.lap_started_at = self.elapsed;
                    Phase::Racing
                } else {
                    Phase::PitLane {
                        remaining,
                        swap,
                        serviced,
                    }
                };
            }
        }
    }

    fn complete_lap(&mut self) {
        self.laps_completed += 1;
        self.lap_progress -= 1.0;
        self.last_lap_time = self.elapsed - self.lap_started_at;
        self.lap_started_at = self.elapsed;

        let seed = f64::from(self.laps_completed);
        self.lap_duration = BASE_LAP_SECS + jitter(seed, 1.5);
        self.fuel_rate = FUEL_PER_LAP + jitter(seed * 1.7, 0.1);

        for (corner, loss) in self.tread.iter_mut().zip(WEAR_PER_LAP) {
            for (i, strip) in corner.iter_mut().enumerate() {
                // outer strips wear a little faster
                let factor = if i == 1 { 0.9 } else { 1.0 };
                *strip = (*strip - loss * factor).max(0.0);
            }
        }

        if noise(seed * 3.1) < 0.08 {
            self.incidents += 2;
        }

        if self.laps_completed % LAPS_PER_STINT == 0 {
            self.stops += 1;
            self.phase = Phase::PitLane {
                remaining: PIT_STOP_SECS,
                swap: self.stops % 2 == 0,
                serviced: false,
            };
        }
    }

    fn service(&mut self, swap: bool) {
        self.fuel = TANK_LITERS;
        self.tread = [[1.0; 3]; 4];
        if swap {
            self.driver = (self.driver + 1) % DRIVERS.len();
            // Incident count is per driver
            self.incidents = 0;
        }
    }

    fn on_pit_road(&self) -> bool {
        matches!(self.phase, Phase::PitLane { .. })
    }

    fn on_track(&self) -> bool {
        match self.phase {
            Phase::PitLane {
                remaining, swap, ..
            } => {
                let half = PIT_STOP_SECS / 2.0;
                let out = DRIVER_SWAP_SECS / 2.0;
                !(swap && remaining <= half + out && remaining > half - out)
            }
            Phase::Racing => true,
        }
    }

    fn to_raw(&self) -> RawSample {
        let mut raw = RawSample::new();
        raw.insert(sample::IS_ON_TRACK.to_string(), json!(self.on_track()));
        raw.insert(sample::ON_PIT_ROAD.to_string(), json!(self.on_pit_road()));
        raw.insert(sample::LAP_COMPLETED.to_string(), json!(self.laps_completed));
        raw.insert(
            sample::LAP_DIST_PCT.to_string(),
            json!(self.lap_progress.clamp(0.0, 0.9999)),
        );
        raw.insert(sample::FUEL_LEVEL.to_string(), json!(self.fuel));
        raw.insert(
            sample::SESSION_TIME_REMAIN.to_string(),
            json!((SESSION_LENGTH_SECS - self.elapsed).max(0.0)),
        );
        raw.insert(sample::LAP_LAST_LAP_TIME.to_string(), json!(self.last_lap_time));
        raw.insert(sample::INCIDENT_COUNT.to_string(), json!(self.incidents));
        raw.insert("SessionTime".to_string(), json!(self.elapsed));

        for (corner, tread) in Corner::ALL.iter().zip(self.tread) {
            for (side, value) in ["L", "M", "R"].iter().zip(tread) {
                raw.insert(format!("{}wear{}", corner.prefix(), side), json!(value));
            }
        }
        raw
    }
}

pub struct DemoSource {
    active: bool,
    step: f64,
    sim: Simulation,
}

impl DemoSource {
    /// Real-time pacing at 60 samples per second
    pub fn new() -> Self {
        Self::with_step(1.0 / 60.0)
    }

    /// Simulated seconds per sample
    pub fn with_step(step: f64) -> Self {
        Self {
            active: false,
            step: if step.is_finite() && step > 0.0 { step } else { 1.0 / 60.0 },
            sim: Simulation::new(),
        }
    }
}

impl Default for DemoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for DemoSource {
    fn key(&self) -> &str {
        "demo"
    }

    fn name(&self) -> &str {
        "Demo"
    }

    fn detect(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<()> {
        self.active = true;
        self.sim = Simulation::new();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.active = false;
        Ok(())
    }

    fn read_sample(&mut self) -> Result<Option<RawSample>> {
        if !self.active {
            return Ok(None);
        }

        let raw = self.sim.to_raw();
        self.sim.advance(self.step);
        Ok(Some(raw))
    }

    fn session_info(&self) -> Option<SessionInfo> {
        Some(SessionInfo {
            track_name: Some(TRACK_NAME.to_string()),
            track_length_km: Some(TRACK_LENGTH_KM),
            session_duration_secs: Some(SESSION_LENGTH_SECS),
            fuel_capacity_liters: Some(TANK_LITERS),
            max_fuel_pct: Some(1.0),
            drivers: DRIVERS
                .iter()
                .map(|name| DriverEntry {
                    name: name.to_string(),
                    car_number: Some("42".to_string()),
                })
                .collect(),
        })
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
