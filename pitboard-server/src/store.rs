//! File-backed snapshot store
//!
//! One file per key: an 8-byte big-endian save time (Unix milliseconds)
//! followed by the zstd-compressed payload. Each write goes through its own
//! temp file and a rename so a crash never leaves a half-written snapshot
//! behind. Writes and removals are serialized, so concurrent savers never
//! interleave.

use chrono::{DateTime, TimeZone, Utc};
use pitboard_core::error::StoreError;
use pitboard_core::store::{SnapshotStore, StoredSnapshot};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::debug;

const HEADER_LEN: usize = 8;
const COMPRESSION_LEVEL: i32 = 3;

pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!("snapshot store at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Unavailable(format!("invalid snapshot key {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.snap", key)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("snapshot store lock poisoned".to_string()))
    }
}

impl SnapshotStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        let data = match std::fs::read(self.path(key)?) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if data.len() < HEADER_LEN {
            return Err(invalid("snapshot file truncated").into());
        }
        let (header, body) = data.split_at(HEADER_LEN);
        let mut millis = [0u8; HEADER_LEN];
        millis.copy_from_slice(header);
        let saved_at = Utc
            .timestamp_millis_opt(i64::from_be_bytes(millis))
            .single()
            .ok_or_else(|| invalid("snapshot timestamp out of range"))?;

        Ok(Some(StoredSnapshot {
            bytes: zstd::decode_all(body)?,
            saved_at,
        }))
    }

    fn set(&self, key: &str, bytes: &[u8], at: DateTime<Utc>) -> Result<(), StoreError> {
        let path = self.path(key)?;
        let mut data = at.timestamp_millis().to_be_bytes().to_vec();
        data.extend(zstd::encode_all(bytes, COMPRESSION_LEVEL)?);

        let _guard = self.lock()?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        let _guard = self.lock()?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use pitboard_core::state::SessionState;
    use pitboard_core::store::{encode_snapshot, load_snapshot, SNAPSHOT_KEY};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 20, 0, 0).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_bytes_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("session", b"hello snapshot", now()).unwrap();
        let got = store.get("session").unwrap().unwrap();
        assert_eq!(got.bytes, b"hello snapshot");
        assert_eq!(got.saved_at, now());
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "only the snapshot itself remains");
    }

    #[test]
    fn test_missing_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.get("session").unwrap().is_none());
        store.remove("session").unwrap();

        store.set("session", b"x", now()).unwrap();
        store.remove("session").unwrap();
        assert!(store.get("session").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_saves_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());

        for round in 0..50u8 {
            let handles: Vec<_> = (0..4u8)
                .map(|writer| {
                    let store = Arc::clone(&store);
                    std::thread::spawn(move || store.set("session", &[round, writer], now()))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }

            let got = store.get("session").unwrap().unwrap();
            assert_eq!(got.bytes[0], round);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.set("../escape", b"x", now()),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_garbage_file_is_discarded_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("session.snap"), b"\x00\x01").unwrap();
        assert!(store.get(SNAPSHOT_KEY).is_err());
        assert!(load_snapshot(&store, Duration::hours(6), now()).is_none());
    }

    #[test]
    fn test_session_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SessionState::new();
        state.last_lap_completed = 31;
        FileStore::open(dir.path())
            .unwrap()
            .set(SNAPSHOT_KEY, &encode_snapshot(&state).unwrap(), now())
            .unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        let patch = load_snapshot(&reopened, Duration::hours(6), now()).unwrap();
        assert_eq!(patch.last_lap_completed, Some(31));
    }
}
