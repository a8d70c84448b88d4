use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use keel_common::error::Result;
use keel_common::types::{LogIndex, NodeId, Term};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Node state that must survive a crash.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    /// Highest index whose command has been applied; replay resumes after it.
    pub last_applied: LogIndex,
}

/// Defines the behavior for any hard state storage backend.
pub trait HardStateStorage: Send + Sync {
    /// Must be durable when it returns.
    fn save(&self, state: &HardState) -> Result<()>;
    fn load(&self) -> Result<Option<HardState>>;
}

/// Saves hard state as a binary file, replaced atomically on every save.
pub struct FileHardStateStorage {
    pub path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileHardStateStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl HardStateStorage for FileHardStateStorage {
    fn save(&self, state: &HardState) -> Result<()> {
        let _guard = self.write_lock.lock();
        let encoded = bincode::serialize(state)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        // make the rename itself durable
        #[cfg(unix)]
        sync_parent_dir(&self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<HardState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let state = bincode::deserialize(&bytes)?;
        Ok(Some(state))
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

/// Keeps hard state in memory; for tests and throwaway nodes.
#[derive(Default)]
pub struct MemHardStateStorage {
    state: Mutex<Option<HardState>>,
}

impl MemHardStateStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HardStateStorage for MemHardStateStorage {
    fn save(&self, state: &HardState) -> Result<()> {
        *self.state.lock() = Some(*state);
        Ok(())
    }

    fn load(&self) -> Result<Option<HardState>> {
        Ok(*self.state.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_state_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHardStateStorage::new(dir.path().join("hard_state.bin"));
        assert_eq!(store.load().unwrap(), None);

        let state = HardState {
            current_term: 3,
            voted_for: Some(NodeId::new_v4()),
            last_applied: 42,
        };
        store.save(&state).expect("Failed to save hard state");
        let loaded = store.load().expect("Failed to load hard state").unwrap();

        assert_eq!(state, loaded);
    }

    #[test]
    fn test_hard_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("hard_state.bin");
        {
            let store = FileHardStateStorage::new(&path);
            store
                .save(&HardState {
                    current_term: 10,
                    voted_for: None,
                    last_applied: 0,
                })
                .unwrap();
            store
                .save(&HardState {
                    current_term: 11,
                    voted_for: None,
                    last_applied: 5,
                })
                .unwrap();
        }

        let store = FileHardStateStorage::new(&path);
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.current_term, 11);
        assert_eq!(loaded.last_applied, 5);
        assert!(!path.with_extension("tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_sync_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        sync_parent_dir(&dir.path().join("hard_state.bin")).unwrap();
        sync_parent_dir(Path::new("hard_state.bin")).unwrap();

        let missing = dir.path().join("gone").join("hard_state.bin");
        assert!(sync_parent_dir(&missing).is_err());
    }

    #[test]
    fn test_mem_storage() {
        let store = MemHardStateStorage::new();
        assert_eq!(store.load().unwrap(), None);
        store.save(&HardState::default()).unwrap();
        assert_eq!(store.load().unwrap(), Some(HardState::default()));
    }
}
