//! Error types for the snapshot store and snapshot loading

use thiserror::Error;

/// Failures talking to a [`SnapshotStore`](crate::store::SnapshotStore).
///
/// These never reach the sample-processing path: the host logs them and
/// retries on the next scheduled save.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage I/O failed
    #[error("snapshot store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded
    #[error("snapshot encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// Store is not reachable or refused the request
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// Reasons a persisted snapshot is treated as absent on load.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Entry is older than the configured retention window
    #[error("snapshot saved at {saved_at} is older than the {retention_secs}s retention window")]
    Expired {
        /// When the entry was written
        saved_at: chrono::DateTime<chrono::Utc>,
        /// Retention window in seconds
        retention_secs: i64,
    },

    /// Payload did not decode into session state
    #[error("snapshot payload is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Store lookup failed
    #[error(transparent)]
    Store(#[from] StoreError),
}
