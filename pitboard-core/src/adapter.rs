//! Sample source trait definition

use crate::sample::{RawSample, SessionInfo};
use anyhow::Result;

/// A telemetry feed the host can poll for raw samples
///
/// Each source is responsible for:
/// - Detecting whether its feed is currently available
/// - Reading raw key→value samples named after the telemetry variables
/// - Reporting session-level metadata when it has any
///
/// Sources do not normalize: that is the engine's job, so every source is
/// held to the same defaulting rules.
pub trait SampleSource: Send + Sync {
    /// Stable machine identifier (e.g. "demo")
    fn key(&self) -> &str;

    /// Human-readable name (e.g. "Demo Endurance Session")
    fn name(&self) -> &str;

    /// Check if the feed is reachable
    ///
    /// This should be a lightweight check.
    fn detect(&self) -> bool;

    /// Start reading
    ///
    /// Called when the feed is detected. Initialize any connections or resources.
    fn start(&mut self) -> Result<()>;

    /// Stop reading
    fn stop(&mut self) -> Result<()>;

    /// Read the next sample
    ///
    /// Returns:
    /// - `Ok(Some(sample))` if a new sample is available
    /// - `Ok(None)` if no new data (non-blocking)
    /// - `Err(_)` if an error occurred
    fn read_sample(&mut self) -> Result<Option<RawSample>>;

    /// Latest session metadata, if the feed provides it
    fn session_info(&self) -> Option<SessionInfo> {
        None
    }

    /// Get whether the source is currently active
    fn is_active(&self) -> bool;
}
