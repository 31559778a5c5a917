//! External snapshot store
//!
//! A get / set-with-timestamp key-value interface. The engine only ever hands
//! it encoded [`StatePatch`] bytes; hosts decide where they live.

use crate::error::{SnapshotError, StoreError};
use crate::state::{SessionState, StatePatch};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Key of the shared session snapshot
pub const SNAPSHOT_KEY: &str = "session";

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub bytes: Vec<u8>,
    pub saved_at: DateTime<Utc>,
}

pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredSnapshot>, StoreError>;

    fn set(&self, key: &str, bytes: &[u8], at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store, used by tests and single-process hosts
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredSnapshot>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl SnapshotStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, bytes: &[u8], at: DateTime<Utc>) -> Result<(), StoreError> {
        self.lock()?.insert(
            key.to_string(),
            StoredSnapshot {
                bytes: bytes.to_vec(),
                saved_at: at,
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Encode the replicated part of `state` for the store
pub fn encode_snapshot(state: &SessionState) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(&state.to_patch())?)
}

/// Decode a stored entry, rejecting it if older than `retention`
pub fn decode_snapshot(
    stored: &StoredSnapshot,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<StatePatch, SnapshotError> {
    if now - stored.saved_at > retention {
        return Err(SnapshotError::Expired {
            saved_at: stored.saved_at,
            retention_secs: retention.num_seconds(),
        });
    }
    Ok(serde_json::from_slice(&stored.bytes)?)
}

/// Load the session snapshot. Missing, expired, corrupt, or unreadable
/// entries all come back as `None`.
pub fn load_snapshot(
    store: &dyn SnapshotStore,
    retention: Duration,
    now: DateTime<Utc>,
) -> Option<StatePatch> {
    let result = store
        .get(SNAPSHOT_KEY)
        .map_err(SnapshotError::from)
        .and_then(|stored| match stored {
            Some(stored) => decode_snapshot(&stored, retention, now).map(Some),
            None => Ok(None),
        });

    match result {
        Ok(Some(patch)) => Some(patch),
        Ok(None) => {
            debug!("no persisted snapshot");
            None
        }
        Err(e @ SnapshotError::Expired { .. }) => {
            debug!("ignoring snapshot: {}", e);
            None
        }
        Err(e) => {
            warn!("discarding snapshot: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 20, 0, 0).unwrap()
    }

    #[test]
    fn test_memory_store_get_set_remove() {
        let store = MemoryStore::new();
        assert!(store.get("k").unwrap().is_none());
        store.set("k", b"abc", now()).unwrap();
        let got = store.get("k").unwrap().unwrap();
        assert_eq!(got.bytes, b"abc");
        assert_eq!(got.saved_at, now());
        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn test_load_round_trip() {
        let store = MemoryStore::new();
        let mut state = SessionState::new();
        state.last_lap_completed = 12;
        store
            .set(SNAPSHOT_KEY, &encode_snapshot(&state).unwrap(), now())
            .unwrap();

        let patch = load_snapshot(&store, Duration::hours(6), now()).unwrap();
        assert_eq!(patch.last_lap_completed, Some(12));
    }

    #[test]
    fn test_expired_snapshot_is_absent() {
        let store = MemoryStore::new();
        let state = SessionState::new();
        let saved = now() - Duration::hours(7);
        store
            .set(SNAPSHOT_KEY, &encode_snapshot(&state).unwrap(), saved)
            .unwrap();

        assert!(load_snapshot(&store, Duration::hours(6), now()).is_none());
        let stored = store.get(SNAPSHOT_KEY).unwrap().unwrap();
        assert!(matches!(
            decode_snapshot(&stored, Duration::hours(6), now()),
            Err(SnapshotError::Expired { retention_secs: 21600, .. })
        ));
    }

    #[test]
    fn test_corrupt_snapshot_is_absent() {
        let store = MemoryStore::new();
        store.set(SNAPSHOT_KEY, b"{not json", now()).unwrap();
        assert!(load_snapshot(&store, Duration::hours(6), now()).is_none());
    }
}
