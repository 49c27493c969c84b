//! Error types for the rankforge-core crate.

use crate::training::session::TrainingStatus;
use thiserror::Error;

/// Top-level error type for training orchestration and adaptation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Mismatched or missing adapter configuration, bad target modules.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Command not valid for the session's current status.
    #[error("Invalid state: cannot {action} session {session_id} while {status}")]
    InvalidState {
        session_id: String,
        status: TrainingStatus,
        action: String,
    },

    /// Buffer allocation or disposal failure.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Step-level failure, including non-finite loss.
    #[error("Training error: {0}")]
    Training(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_state(
        session_id: impl Into<String>,
        status: TrainingStatus,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            session_id: session_id.into(),
            status,
            action: action.into(),
        }
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether the error was raised before any state was touched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvalidState { .. } | Self::NotFound(_)
        )
    }
}
