//! Buffer gate
//!
//! Right after a driver gets in the car the lap in progress is partial, so
//! the values derived from it are unreliable. The gate freezes the
//! display-facing output from driver entry until `settle_laps` full laps have
//! been completed, and tracks the last sample observed while live.
//!
//! ```text
//!   NoDriver --on_track false->true--> Settling --lap >= entry + settle--> Live
//!      ^                                  |                                 |
//!      +-------- on_track true->false ----+---------------------------------+
//! ```

use crate::sample::Sample;
use crate::state::{GatePhase, SessionState};

/// Phase change produced by one observation
#[derive(Debug, Clone, PartialEq)]
pub enum GateTransition {
    DriverEntered { lap: i32 },
    WentLive { lap: i32 },
    LapAdvanced { lap: i32 },
    /// Carries the last live sample, or the exit sample itself if the
    /// driver never got past settling
    DriverExited { lap: i32, last_gated: Sample },
}

pub struct BufferGate {
    settle_laps: i32,
}

impl BufferGate {
    pub fn new(settle_laps: i32) -> Self {
        Self {
            settle_laps: settle_laps.max(0),
        }
    }

    pub fn settle_laps(&self) -> i32 {
        self.settle_laps
    }

    /// Advance the gate with one sample
    pub fn observe(&self, state: &mut SessionState, sample: &Sample) -> Option<GateTransition> {
        let lap = sample
            .lap_completed
            .or(state.last_observed_lap)
            .unwrap_or(0);

        let transition = match (state.gate_phase, sample.on_track) {
            (GatePhase::NoDriver, true) => {
                state.gate_phase = GatePhase::Settling;
                state.lap_entry_point = Some(lap);
                state.buffer_frozen = true;
                // A zero-lap settle goes live on the entry sample itself
                self.try_go_live(state, sample, lap)
                    .or(Some(GateTransition::DriverEntered { lap }))
            }
            (GatePhase::Settling, true) => self.try_go_live(state, sample, lap),
            (GatePhase::Live, true) => {
                if state.last_observed_lap != Some(lap) {
                    state.gated_sample = Some(sample.clone());
                    Some(GateTransition::LapAdvanced { lap })
                } else {
                    None
                }
            }
            (GatePhase::Settling | GatePhase::Live, false) => {
                state.gate_phase = GatePhase::NoDriver;
                state.buffer_frozen = true;
                let last_gated = state
                    .gated_sample
                    .take()
                    .unwrap_or_else(|| sample.clone());
                Some(GateTransition::DriverExited { lap, last_gated })
            }
            (GatePhase::NoDriver, false) => None,
        };

        state.last_observed_lap = Some(lap);
        transition
    }

    fn try_go_live(
        &self,
        state: &mut SessionState,
        sample: &Sample,
        lap: i32,
    ) -> Option<GateTransition> {
        let entry = state.lap_entry_point.unwrap_or(lap);
        if lap < entry.saturating_add(self.settle_laps) {
            return None;
        }
        state.gate_phase = GatePhase::Live;
        state.buffer_frozen = false;
        state.gated_sample = Some(sample.clone());
        Some(GateTransition::WentLive { lap })
    }
}
