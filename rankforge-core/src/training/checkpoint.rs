//! Model checkpoints: progress markers plus serialized adapter state.

use crate::adapters::AdapterState;
use crate::error::EngineError;
use crate::training::progress::TrainingProgress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An immutable snapshot of a session's adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCheckpoint {
    pub id: String,
    pub session_id: String,
    pub epoch: usize,
    pub step: usize,
    pub loss: Option<f32>,
    pub accuracy: Option<f32>,
    pub state: AdapterState,
    /// SHA-256 of the serialized state.
    pub hash: String,
    /// Serialized state size in bytes.
    pub size_bytes: u64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl ModelCheckpoint {
    pub fn capture(
        session_id: &str,
        progress: &TrainingProgress,
        state: AdapterState,
        description: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let bytes = serde_json::to_vec(&state)?;
        let hash = format!("{:x}", Sha256::digest(&bytes));
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            epoch: progress.current_epoch,
            step: progress.current_step,
            loss: progress.last_loss(),
            accuracy: progress.last_accuracy(),
            state,
            hash,
            size_bytes: bytes.len() as u64,
            description: description.into(),
            created_at: Utc::now(),
        })
    }

    /// A new record with the same markers and state as `self`.
    pub fn duplicate(&self, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Recompute the state hash and compare against the recorded one.
    pub fn verify(&self) -> Result<bool, EngineError> {
        let bytes = serde_json::to_vec(&self.state)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)) == self.hash)
    }

    pub fn to_ref(&self) -> CheckpointRef {
        CheckpointRef {
            id: self.id.clone(),
            epoch: self.epoch,
            step: self.step,
            loss: self.loss,
            size_bytes: self.size_bytes,
            description: self.description.clone(),
            created_at: self.created_at,
        }
    }
}

/// Lightweight checkpoint entry kept on the session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRef {
    pub id: String,
    pub epoch: usize,
    pub step: usize,
    pub loss: Option<f32>,
    pub size_bytes: u64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}
