//! Run event callbacks.

use crate::training::progress::{TrainingMetrics, TrainingProgress};
use async_trait::async_trait;
use tracing::{error, info};

/// Receives the event stream of a training run.
///
/// Events for one session arrive in step order. Implementations must not
/// call back into the orchestrator's `stop` from inside a callback.
#[async_trait]
pub trait TrainingCallback: Send + Sync {
    /// Called every K steps and at each epoch boundary.
    async fn on_progress(&self, session_id: &str, progress: &TrainingProgress, metrics: &TrainingMetrics);

    async fn on_complete(&self, session_id: &str, progress: &TrainingProgress);

    async fn on_error(&self, session_id: &str, message: &str);

    /// Called once when a run stops cooperatively.
    async fn on_paused(&self, _session_id: &str, _progress: &TrainingProgress) {}
}

/// Callback that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallback;

#[async_trait]
impl TrainingCallback for NoopCallback {
    async fn on_progress(&self, _session_id: &str, _progress: &TrainingProgress, _metrics: &TrainingMetrics) {}
    async fn on_complete(&self, _session_id: &str, _progress: &TrainingProgress) {}
    async fn on_error(&self, _session_id: &str, _message: &str) {}
}

/// Relays run events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCallback;

#[async_trait]
impl TrainingCallback for LoggingCallback {
    async fn on_progress(&self, session_id: &str, progress: &TrainingProgress, metrics: &TrainingMetrics) {
        info!(
            session_id,
            epoch = progress.current_epoch,
            step = progress.current_step,
            total_steps = progress.total_steps,
            loss = progress.last_loss().unwrap_or(f32::NAN),
            completion = progress.completion_percentage,
            eta_secs = progress.estimated_time_remaining,
            steps_per_sec = metrics.training_speed,
            "Training progress"
        );
    }

    async fn on_complete(&self, session_id: &str, progress: &TrainingProgress) {
        info!(
            session_id,
            epochs = progress.current_epoch,
            steps = progress.current_step,
            loss = progress.last_loss().unwrap_or(f32::NAN),
            "Training completed"
        );
    }

    async fn on_error(&self, session_id: &str, message: &str) {
        error!(session_id, error = message, "Training failed");
    }

    async fn on_paused(&self, session_id: &str, progress: &TrainingProgress) {
        info!(session_id, step = progress.current_step, "Training paused");
    }
}

/// Terminal event recorded by [`RecordingCallback`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunEnd {
    Completed(TrainingProgress),
    Paused(TrainingProgress),
    Failed(String),
}

/// A callback that records every event, for tests and inspection.
pub struct RecordingCallback {
    progress: tokio::sync::Mutex<Vec<(TrainingProgress, TrainingMetrics)>>,
    ends: tokio::sync::Mutex<Vec<RunEnd>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self {
            progress: tokio::sync::Mutex::new(Vec::new()),
            ends: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn progress_events(&self) -> Vec<(TrainingProgress, TrainingMetrics)> {
        self.progress.lock().await.clone()
    }

    /// Progress events emitted at epoch boundaries.
    pub async fn epoch_events(&self) -> Vec<TrainingProgress> {
        self.progress
            .lock()
            .await
            .iter()
            .filter(|(p, _)| {
                p.current_epoch > 0 && p.current_step * p.total_epochs == p.current_epoch * p.total_steps
            })
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub async fn ends(&self) -> Vec<RunEnd> {
        self.ends.lock().await.clone()
    }

    pub async fn errors(&self) -> Vec<String> {
        self.ends
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                RunEnd::Failed(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for RecordingCallback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrainingCallback for RecordingCallback {
    async fn on_progress(&self, _session_id: &str, progress: &TrainingProgress, metrics: &TrainingMetrics) {
        self.progress.lock().await.push((progress.clone(), metrics.clone()));
    }

    async fn on_complete(&self, _session_id: &str, progress: &TrainingProgress) {
        self.ends.lock().await.push(RunEnd::Completed(progress.clone()));
    }

    async fn on_error(&self, _session_id: &str, message: &str) {
        self.ends.lock().await.push(RunEnd::Failed(message.to_string()));
    }

    async fn on_paused(&self, _session_id: &str, progress: &TrainingProgress) {
        self.ends.lock().await.push(RunEnd::Paused(progress.clone()));
    }
}
