//! Session and checkpoint storage.
//!
//! The engine treats storage as an opaque record store. [`JsonFileStore`]
//! keeps one JSON document per record and writes each one atomically;
//! there is no atomicity across records.

use crate::error::EngineError;
use crate::training::checkpoint::ModelCheckpoint;
use crate::training::session::TrainingSession;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Atomically write JSON data to a file.
///
/// Writes to a `.tmp` sibling file, then renames over the target path.
/// Creates parent directories if they don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Durable home for sessions and their checkpoints.
pub trait SessionStore: Send + Sync {
    fn save_session(&self, session: &TrainingSession) -> Result<(), EngineError>;

    fn load_session(&self, id: &str) -> Result<Option<TrainingSession>, EngineError>;

    fn list_sessions(&self) -> Result<Vec<TrainingSession>, EngineError>;

    fn delete_session(&self, id: &str) -> Result<(), EngineError>;

    fn save_checkpoint(&self, checkpoint: &ModelCheckpoint) -> Result<(), EngineError>;

    fn load_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Result<Option<ModelCheckpoint>, EngineError>;

    /// Oldest first.
    fn list_checkpoints(&self, session_id: &str) -> Result<Vec<ModelCheckpoint>, EngineError>;

    fn delete_checkpoints(&self, session_id: &str) -> Result<(), EngineError>;
}

/// `{root}/sessions/{id}.json` and `{root}/checkpoints/{session}/{id}.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{id}.json"))
    }

    fn checkpoint_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("checkpoints").join(session_id)
    }

    fn json_files(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl SessionStore for JsonFileStore {
    fn save_session(&self, session: &TrainingSession) -> Result<(), EngineError> {
        atomic_write_json(&self.session_path(&session.id), session)?;
        Ok(())
    }

    fn load_session(&self, id: &str) -> Result<Option<TrainingSession>, EngineError> {
        Ok(load_json(&self.session_path(id))?)
    }

    fn list_sessions(&self) -> Result<Vec<TrainingSession>, EngineError> {
        let mut sessions = Vec::new();
        for path in Self::json_files(&self.root.join("sessions"))? {
            if let Some(session) = load_json::<TrainingSession>(&path)? {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    fn delete_session(&self, id: &str) -> Result<(), EngineError> {
        let path = self.session_path(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: &ModelCheckpoint) -> Result<(), EngineError> {
        let path = self
            .checkpoint_dir(&checkpoint.session_id)
            .join(format!("{}.json", checkpoint.id));
        atomic_write_json(&path, checkpoint)?;
        Ok(())
    }

    fn load_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Result<Option<ModelCheckpoint>, EngineError> {
        Ok(load_json(&self.checkpoint_dir(session_id).join(format!("{checkpoint_id}.json")))?)
    }

    fn list_checkpoints(&self, session_id: &str) -> Result<Vec<ModelCheckpoint>, EngineError> {
        let mut checkpoints = Vec::new();
        for path in Self::json_files(&self.checkpoint_dir(session_id))? {
            if let Some(checkpoint) = load_json::<ModelCheckpoint>(&path)? {
                checkpoints.push(checkpoint);
            }
        }
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.step.cmp(&b.step)));
        Ok(checkpoints)
    }

    fn delete_checkpoints(&self, session_id: &str) -> Result<(), EngineError> {
        let dir = self.checkpoint_dir(session_id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Process-local store, for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, TrainingSession>>,
    checkpoints: RwLock<HashMap<String, Vec<ModelCheckpoint>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> EngineError {
    EngineError::resource("in-memory store lock poisoned")
}

impl SessionStore for InMemoryStore {
    fn save_session(&self, session: &TrainingSession) -> Result<(), EngineError> {
        self.sessions
            .write()
            .map_err(|_| poisoned())?
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn load_session(&self, id: &str) -> Result<Option<TrainingSession>, EngineError> {
        Ok(self.sessions.read().map_err(|_| poisoned())?.get(id).cloned())
    }

    fn list_sessions(&self) -> Result<Vec<TrainingSession>, EngineError> {
        let mut sessions: Vec<_> = self.sessions.read().map_err(|_| poisoned())?.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    fn delete_session(&self, id: &str) -> Result<(), EngineError> {
        self.sessions.write().map_err(|_| poisoned())?.remove(id);
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: &ModelCheckpoint) -> Result<(), EngineError> {
        let mut map = self.checkpoints.write().map_err(|_| poisoned())?;
        let list = map.entry(checkpoint.session_id.clone()).or_default();
        list.retain(|c| c.id != checkpoint.id);
        list.push(checkpoint.clone());
        Ok(())
    }

    fn load_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Result<Option<ModelCheckpoint>, EngineError> {
        Ok(self
            .checkpoints
            .read()
            .map_err(|_| poisoned())?
            .get(session_id)
            .and_then(|list| list.iter().find(|c| c.id == checkpoint_id).cloned()))
    }

    fn list_checkpoints(&self, session_id: &str) -> Result<Vec<ModelCheckpoint>, EngineError> {
        Ok(self
            .checkpoints
            .read()
            .map_err(|_| poisoned())?
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    fn delete_checkpoints(&self, session_id: &str) -> Result<(), EngineError> {
        self.checkpoints.write().map_err(|_| poisoned())?.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterState, DoraState};
    use crate::training::progress::TrainingProgress;
    use crate::training::session::{ModelConfiguration, ModelType};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn session(name: &str) -> TrainingSession {
        TrainingSession::new(name, ModelType::Dora, ModelConfiguration::dora(4, vec!["q_proj".into()]))
    }

    fn checkpoint(session_id: &str, step: usize) -> ModelCheckpoint {
        let mut progress = TrainingProgress::new(1);
        progress.current_step = step;
        ModelCheckpoint::capture(
            session_id,
            &progress,
            AdapterState::Dora(DoraState { weights: Vec::new() }),
            format!("step {step}"),
        )
        .unwrap()
    }

    fn exercise(store: &dyn SessionStore) {
        let a = session("a");
        let b = session("b");
        store.save_session(&a).unwrap();
        store.save_session(&b).unwrap();
        assert_eq!(store.load_session(&a.id).unwrap().map(|s| s.name), Some("a".to_string()));
        assert_eq!(store.list_sessions().unwrap().len(), 2);
        assert!(store.load_session("missing").unwrap().is_none());

        let c1 = checkpoint(&a.id, 1);
        let c2 = checkpoint(&a.id, 2);
        store.save_checkpoint(&c1).unwrap();
        store.save_checkpoint(&c2).unwrap();
        let steps: Vec<usize> = store.list_checkpoints(&a.id).unwrap().iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![1, 2]);
        let loaded = store.load_checkpoint(&a.id, &c2.id).unwrap().unwrap();
        assert!(loaded.verify().unwrap());
        assert!(store.list_checkpoints(&b.id).unwrap().is_empty());

        store.delete_checkpoints(&a.id).unwrap();
        store.delete_session(&a.id).unwrap();
        assert!(store.load_session(&a.id).unwrap().is_none());
        assert!(store.list_checkpoints(&a.id).unwrap().is_empty());
        assert_eq!(store.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemoryStore::new());
    }

    #[test]
    fn test_json_file_store() {
        let dir = TempDir::new().unwrap();
        exercise(&JsonFileStore::new(dir.path()));
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("record.json");
        atomic_write_json(&path, &vec![1, 2, 3]).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        let back: Option<Vec<i32>> = load_json(&path).unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_load_json_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let result: io::Result<Option<TrainingSession>> = load_json(&path);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
