//! Last-access persistence
//!
//! Two [`LastAccessStore`] implementations: [`MemoryStore`] for tests and
//! embedding hosts that persist elsewhere, and [`JsonFileStore`], which keeps
//! the same state in a JSON file and rewrites it atomically on every change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::subscription::{LastAccessStore, Timestamp};

/// Serialized form of the persisted state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub last_access: HashMap<String, Timestamp>,
    #[serde(default)]
    pub last_opened_channel: Option<String>,
}

/// In-memory store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl LastAccessStore for MemoryStore {
    fn all_last_access(&self) -> HashMap<String, Timestamp> {
        self.read().last_access.clone()
    }

    fn set_last_access(&self, channel_id: &str, at: Timestamp) -> Result<(), StoreError> {
        self.write().last_access.insert(channel_id.to_string(), at);
        Ok(())
    }

    fn last_opened_channel(&self) -> Option<String> {
        self.read().last_opened_channel.clone()
    }

    fn set_last_opened_channel(&self, channel_id: Option<&str>) -> Result<(), StoreError> {
        self.write().last_opened_channel = channel_id.map(str::to_string);
        Ok(())
    }
}

/// JSON-file backed store
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    /// Open the store, starting empty if the file does not exist yet
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No state file, starting empty");
                StoreState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            inner: MemoryStore::with_state(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write through a sibling temp file so a crash never leaves a torn file
    fn flush(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&*self.inner.read())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl LastAccessStore for JsonFileStore {
    fn all_last_access(&self) -> HashMap<String, Timestamp> {
        self.inner.all_last_access()
    }

    fn set_last_access(&self, channel_id: &str, at: Timestamp) -> Result<(), StoreError> {
        self.inner.set_last_access(channel_id, at)?;
        self.flush()
    }

    fn last_opened_channel(&self) -> Option<String> {
        self.inner.last_opened_channel()
    }

    fn set_last_opened_channel(&self, channel_id: Option<&str>) -> Result<(), StoreError> {
        self.inner.set_last_opened_channel(channel_id)?;
        self.flush()
    }
}
