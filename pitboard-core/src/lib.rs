//! Pitboard Core Library
//!
//! Derives endurance-racing metrics (rolling fuel and lap-time averages, fuel
//! range, stint summaries) from a raw telemetry sample stream, and keeps the
//! derived session state consistent across dashboard instances.

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod history;
pub mod lap;
pub mod metrics;
pub mod replicator;
pub mod sample;
pub mod state;
pub mod stint;
pub mod store;
pub mod units;

pub use adapter::SampleSource;
pub use config::EngineConfig;
pub use engine::{Engine, EngineEvent, EngineUpdate};
pub use error::{SnapshotError, StoreError};
pub use metrics::MetricsRecord;
pub use replicator::{InstanceId, Outbound, PeerMessage, RemoteStateEnvelope};
pub use sample::{RawSample, Sample, SessionInfo};
pub use state::{SessionState, StatePatch};
pub use store::{MemoryStore, SnapshotStore, StoredSnapshot};
