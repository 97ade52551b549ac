// src/store.rs - restart snapshot stores
use kiln_shared::{PersistedSnapshot, PersistenceStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Snapshot kept in a JSON file. Writes go through a sibling temp file and a
/// rename so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl PersistenceStore for JsonFileStore {
    fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
        let json =
            serde_json::to_vec_pretty(snapshot).map_err(|e| StoreError::Json(e.to_string()))?;
        let temp = self.temp_path();
        std::fs::write(&temp, json)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Option<PersistedSnapshot> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Cannot read state file {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Ignoring unreadable state file {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

/// In-process store, for tests and runs without a state file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: Mutex<Option<PersistedSnapshot>>,
    fail_saves: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: PersistedSnapshot) -> Self {
        Self {
            slot: Mutex::new(Some(snapshot)),
            fail_saves: Mutex::new(false),
        }
    }

    /// Make every following save fail until switched back.
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    pub fn snapshot(&self) -> Option<PersistedSnapshot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PersistenceStore for MemoryStore {
    fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
        if *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(StoreError::Unavailable("saves disabled".to_string()));
        }
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Option<PersistedSnapshot> {
        self.snapshot()
    }
}
