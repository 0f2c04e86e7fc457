//! # Persistence
//!
//! Durable snapshots of a memory store as two files under one directory:
//!
//! - `<id>_ivf_index.bin`: the IVF index plus the pending embedding buffer, `bincode`-encoded.
//! - `<id>_conversations.yaml`: every user's log and the global index-position table.
//!
//! `<id>` is derived from the store name, so several stores can share a directory.
//! Both files carry the same save generation; a pair with different generations was
//! torn by a crash between the two writes.
//! Each file is written to a temporary file in the same directory, synced, then renamed
//! over the old one; a crash mid-save leaves the previous file intact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::conversation::{ConversationTurn, TurnRef};
use crate::error::{MemoryError, Result};
use crate::vector_store::IndexSnapshot;

/// Contents of the binary index file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFile {
    pub generation: u64,
    pub snapshot: IndexSnapshot,
}

/// Contents of the structured snapshot file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    #[serde(default)]
    pub generation: u64,
    pub users: BTreeMap<String, Vec<ConversationTurn>>,
    pub index_positions: Vec<TurnRef>,
}

/// Whatever was found on disk. Missing files are `None`.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub index: Option<IndexFile>,
    pub conversations: Option<ConversationSnapshot>,
}

/// Reads and writes the two state files of one store.
#[derive(Debug, Clone)]
pub struct PersistenceManager {
    dir: PathBuf,
    index_path: PathBuf,
    snapshot_path: PathBuf,
}

/// Stable short id for a store name.
fn store_id(store_name: &str) -> String {
    let digest = sha256::digest(store_name);
    digest[..16].to_string()
}

impl PersistenceManager {
    /// # Parameters
    /// - `dir`: Directory for both files; created on first save.
    /// - `store_name`: Used to derive the file names.
    pub fn new(dir: impl Into<PathBuf>, store_name: &str) -> Self {
        let dir = dir.into();
        let id = store_id(store_name);
        Self {
            index_path: dir.join(format!("{id}_ivf_index.bin")),
            snapshot_path: dir.join(format!("{id}_conversations.yaml")),
            dir,
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Write both files atomically. The index file is written first.
    ///
    /// # Errors
    /// [`MemoryError::PersistenceFailure`] naming the file that could not be written.
    pub fn save(&self, index: &IndexFile, conversations: &ConversationSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| MemoryError::persistence(&self.dir, e))?;

        let index_bytes = bincode::serde::encode_to_vec(index, bincode::config::standard())
            .map_err(|e| MemoryError::persistence(&self.index_path, e))?;
        self.write_atomic(&self.index_path, &index_bytes)?;

        let yaml = serde_yaml::to_string(conversations)
            .map_err(|e| MemoryError::persistence(&self.snapshot_path, e))?;
        self.write_atomic(&self.snapshot_path, yaml.as_bytes())?;

        info!(
            index = %self.index_path.display(),
            snapshot = %self.snapshot_path.display(),
            generation = index.generation,
            ntotal = index.snapshot.index.ntotal(),
            users = conversations.users.len(),
            "Memory store saved"
        );
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| MemoryError::persistence(path, e))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| MemoryError::persistence(path, e))?;
        tmp.persist(path)
            .map_err(|e| MemoryError::persistence(path, e.error))?;
        Ok(())
    }

    /// Read whichever files exist.
    ///
    /// An index file that cannot be decoded is logged and treated as missing, so the
    /// conversations still load.
    ///
    /// # Errors
    /// [`MemoryError::PersistenceFailure`] if the snapshot file exists but cannot be read
    /// or decoded.
    pub fn load(&self) -> Result<LoadedState> {
        let mut state = LoadedState::default();

        if self.index_path.exists() {
            match self.load_index() {
                Ok(index) => {
                    info!(
                        path = %self.index_path.display(),
                        generation = index.generation,
                        trained = index.snapshot.index.is_trained(),
                        ntotal = index.snapshot.index.ntotal(),
                        "Index loaded"
                    );
                    state.index = Some(index);
                }
                Err(e) => error!(error = %e, "Unreadable index file; ignoring it"),
            }
        } else {
            warn!(path = %self.index_path.display(), "No index file found; starting untrained");
        }

        if self.snapshot_path.exists() {
            let yaml = fs::read_to_string(&self.snapshot_path)
                .map_err(|e| MemoryError::persistence(&self.snapshot_path, e))?;
            let conversations: ConversationSnapshot = serde_yaml::from_str(&yaml)
                .map_err(|e| MemoryError::persistence(&self.snapshot_path, e))?;
            info!(
                path = %self.snapshot_path.display(),
                generation = conversations.generation,
                users = conversations.users.len(),
                "Conversation snapshot loaded"
            );
            state.conversations = Some(conversations);
        } else {
            warn!(path = %self.snapshot_path.display(), "No conversation snapshot found; starting empty");
        }

        Ok(state)
    }

    fn load_index(&self) -> Result<IndexFile> {
        let bytes =
            fs::read(&self.index_path).map_err(|e| MemoryError::persistence(&self.index_path, e))?;
        let (index, _): (IndexFile, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| MemoryError::persistence(&self.index_path, e))?;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::vector_store::VectorStore;

    fn sample_index() -> IndexFile {
        let mut vs = VectorStore::new(2, 2, 1, 2);
        vs.add(vec![0.0, 1.0], TurnRef::new("alice", 0)).unwrap();
        vs.add(vec![1.0, 0.0], TurnRef::new("alice", 2)).unwrap();
        vs.add(vec![1.0, 1.0], TurnRef::new("bob", 0)).unwrap();
        IndexFile {
            generation: 3,
            snapshot: vs.snapshot().0,
        }
    }

    #[test]
    fn missing_files_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PersistenceManager::new(dir.path().join("absent"), "default");
        let state = pm.load().unwrap();
        assert!(state.index.is_none());
        assert!(state.conversations.is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PersistenceManager::new(dir.path(), "chat");

        let index = sample_index();
        let mut users = BTreeMap::new();
        users.insert(
            "alice".to_string(),
            vec![
                ConversationTurn::new(Role::User, "hello"),
                ConversationTurn::new(Role::Assistant, "hi there"),
                ConversationTurn::new(Role::User, "goodbye"),
            ],
        );
        let conversations = ConversationSnapshot {
            generation: 3,
            users,
            index_positions: vec![TurnRef::new("alice", 0), TurnRef::new("alice", 2)],
        };

        pm.save(&index, &conversations).unwrap();
        assert!(pm.index_path().exists());
        assert!(pm.snapshot_path().exists());

        let state = pm.load().unwrap();
        assert_eq!(state.index.unwrap(), index);
        assert_eq!(state.conversations.unwrap(), conversations);
    }

    #[test]
    fn store_names_map_to_distinct_files() {
        let a = PersistenceManager::new("/tmp/x", "alpha");
        let b = PersistenceManager::new("/tmp/x", "beta");
        assert_ne!(a.index_path(), b.index_path());
        assert_eq!(
            a.index_path(),
            PersistenceManager::new("/tmp/x", "alpha").index_path()
        );
    }

    #[test]
    fn corrupt_index_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PersistenceManager::new(dir.path(), "default");
        pm.save(&sample_index(), &ConversationSnapshot::default())
            .unwrap();
        fs::write(pm.index_path(), b"not bincode at all").unwrap();

        let state = pm.load().unwrap();
        assert!(state.index.is_none());
        assert_eq!(state.conversations, Some(ConversationSnapshot::default()));
    }

    #[test]
    fn corrupt_snapshot_is_a_persistence_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PersistenceManager::new(dir.path(), "default");
        fs::write(pm.snapshot_path(), "users: [unterminated").unwrap();
        assert!(matches!(
            pm.load(),
            Err(MemoryError::PersistenceFailure { .. })
        ));
    }

    #[test]
    fn save_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PersistenceManager::new(dir.path(), "default");
        pm.save(&sample_index(), &ConversationSnapshot::default())
            .unwrap();
        pm.save(&sample_index(), &ConversationSnapshot::default())
            .unwrap();
        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }
}
