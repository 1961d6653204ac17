//! Durable SDK state: the persisted sampling probability and device id.
//!
//! Hosts supply a [`Persistence`] implementation (or rely on the bundled
//! stores). All failures here are logged and swallowed by the callers; a
//! broken store degrades the SDK to in-memory defaults, it never breaks
//! span creation or delivery.

use crate::beam_warn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Version of the on-disk record. A mismatch invalidates the whole record.
pub const PERSISTED_STATE_VERSION: u32 = 1;

/// Failure reported by a [`Persistence`] implementation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PersistenceError {
    /// Reading or writing the underlying store failed.
    #[error("persistence i/o failed: {0}")]
    Io(#[from] io::Error),
    /// The record could not be serialized or deserialized.
    #[error("persisted state could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A sampling probability together with the unix-millisecond wall time it
/// was learned, for the 24-hour freshness check.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedProbability {
    /// The learned probability, in `0.0..=1.0`.
    pub value: f64,
    /// Unix milliseconds at which the value was learned.
    pub time: u64,
}

/// The complete persisted record. Fields are optional so partial state
/// (device id without probability, or vice versa) round-trips unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Record format version; see [`PERSISTED_STATE_VERSION`].
    pub version: u32,
    /// The most recently learned sampling probability.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sampling_probability: Option<PersistedProbability>,
    /// Stable per-install identifier, minted on first delivery.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_id: Option<String>,
}

impl Default for PersistedState {
    fn default() -> Self {
        PersistedState {
            version: PERSISTED_STATE_VERSION,
            sampling_probability: None,
            device_id: None,
        }
    }
}

/// Capability trait for durable storage, supplied by the host.
///
/// Loads and saves carry the whole record; callers read-modify-write. The
/// record is a few hundred bytes at most, so implementations may perform
/// I/O synchronously inside the future.
#[async_trait]
pub trait Persistence: Send + Sync + fmt::Debug + 'static {
    /// Load the current record. `Ok(None)` means no usable record exists
    /// (missing, corrupt, or from an incompatible version).
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError>;

    /// Replace the record.
    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError>;
}

/// File-backed store writing one JSON document, atomically
/// (write-temp-then-rename), so a crash mid-save never leaves a torn record.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    /// A store backed by the file at `path`. Parent directories are created
    /// on first save.
    pub fn new(path: impl Into<PathBuf>) -> FilePersistence {
        FilePersistence { path: path.into() }
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let state: PersistedState = match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(error) => {
                beam_warn!(
                    name: "Persistence.CorruptRecord",
                    message = "discarding unreadable persisted state",
                    reason = format!("{error}")
                );
                return Ok(None);
            }
        };

        if state.version != PERSISTED_STATE_VERSION {
            beam_warn!(
                name: "Persistence.VersionMismatch",
                found = state.version,
                expected = PERSISTED_STATE_VERSION
            );
            return Ok(None);
        }

        Ok(Some(state))
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(state)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp = self.path.with_extension("tmp");
        std::fs::write(&temp, &bytes)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

/// Store that lives only as long as the process. The default when the host
/// supplies nothing; also convenient in tests. Clones share the record.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPersistence {
    state: Arc<Mutex<Option<PersistedState>>>,
}

impl InMemoryPersistence {
    /// An empty store.
    pub fn new() -> InMemoryPersistence {
        InMemoryPersistence::default()
    }

    /// A store pre-populated with `state`, as if a previous run saved it.
    pub fn with_state(state: PersistedState) -> InMemoryPersistence {
        InMemoryPersistence {
            state: Arc::new(Mutex::new(Some(state))),
        }
    }

    /// The last saved record, if any.
    pub fn snapshot(&self) -> Option<PersistedState> {
        self.state.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        let state = self.state.lock().ok().and_then(|guard| guard.clone());
        Ok(state.filter(|s| s.version == PERSISTED_STATE_VERSION))
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        if let Ok(mut guard) = self.state.lock() {
            *guard = Some(state.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_executor::block_on;

    fn sample_state() -> PersistedState {
        PersistedState {
            version: PERSISTED_STATE_VERSION,
            sampling_probability: Some(PersistedProbability {
                value: 0.25,
                time: 1_700_000_000_000,
            }),
            device_id: Some("c0ffee0123456789".to_owned()),
        }
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path().join("state.json"));

        assert_eq!(block_on(store.load()).unwrap(), None);
        block_on(store.save(&sample_state())).unwrap();
        assert_eq!(block_on(store.load()).unwrap(), Some(sample_state()));
    }

    #[test]
    fn file_store_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path().join("state.json"));
        block_on(store.save(&sample_state())).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }

    #[test]
    fn corrupt_record_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = FilePersistence::new(path);
        assert_eq!(block_on(store.load()).unwrap(), None);
    }

    #[test]
    fn version_mismatch_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = sample_state();
        state.version = PERSISTED_STATE_VERSION + 1;
        std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

        let store = FilePersistence::new(path);
        assert_eq!(block_on(store.load()).unwrap(), None);
    }

    #[test]
    fn file_store_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path().join("nested/deep/state.json"));
        block_on(store.save(&sample_state())).unwrap();
        assert_eq!(block_on(store.load()).unwrap(), Some(sample_state()));
    }

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryPersistence::new();
        assert_eq!(block_on(store.load()).unwrap(), None);
        block_on(store.save(&sample_state())).unwrap();
        assert_eq!(block_on(store.load()).unwrap(), Some(sample_state()));
        assert_eq!(store.snapshot(), Some(sample_state()));
    }

    #[test]
    fn partial_record_round_trips_unknown_fields_absent() {
        let json = serde_json::json!({ "version": PERSISTED_STATE_VERSION, "device_id": "ab12" });
        let state: PersistedState = serde_json::from_value(json).unwrap();
        assert_eq!(state.sampling_probability, None);
        assert_eq!(state.device_id.as_deref(), Some("ab12"));

        let encoded = serde_json::to_value(&state).unwrap();
        assert!(encoded.get("sampling_probability").is_none());
    }
}
