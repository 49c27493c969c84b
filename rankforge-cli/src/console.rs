//! Terminal rendering of run events.

use async_trait::async_trait;
use rankforge_core::training::{TrainingCallback, TrainingMetrics, TrainingProgress, TrainingSession};

/// Prints one line per progress event to stdout.
pub struct ConsoleCallback {
    quiet: bool,
}

impl ConsoleCallback {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

fn format_loss(value: Option<f32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"))
}

#[async_trait]
impl TrainingCallback for ConsoleCallback {
    async fn on_progress(&self, _session_id: &str, progress: &TrainingProgress, metrics: &TrainingMetrics) {
        if self.quiet {
            return;
        }
        let mut line = format!(
            "  epoch {}/{}  step {:>5}/{}  loss {}  acc {}  lr {}  {:5.1}%  eta {:.0}s  {:.1} steps/s",
            progress.current_epoch,
            progress.total_epochs,
            progress.current_step,
            progress.total_steps,
            format_loss(progress.last_loss()),
            format_loss(progress.last_accuracy()),
            progress
                .learning_rate_history
                .last()
                .map_or_else(|| "-".to_string(), |lr| format!("{lr:.2e}")),
            progress.completion_percentage,
            progress.estimated_time_remaining,
            metrics.training_speed,
        );
        if let Some(val) = progress.validation_loss {
            line.push_str(&format!("  val_loss {val:.4}"));
        }
        println!("{line}");
    }

    async fn on_complete(&self, session_id: &str, progress: &TrainingProgress) {
        println!(
            "Session {session_id} completed: {} steps, final loss {}",
            progress.current_step,
            format_loss(progress.last_loss())
        );
    }

    async fn on_error(&self, session_id: &str, message: &str) {
        eprintln!("Session {session_id} failed: {message}");
    }

    async fn on_paused(&self, session_id: &str, progress: &TrainingProgress) {
        println!(
            "Session {session_id} paused at step {}/{}",
            progress.current_step, progress.total_steps
        );
    }
}

/// One row of `rankforge list`.
pub fn session_row(session: &TrainingSession) -> String {
    format!(
        "{:<36}  {:<16}  {:<19}  {:<9}  {:>6}/{:<6}  {}",
        session.id,
        truncate(&session.name, 16),
        session.model_type.to_string(),
        session.status.to_string(),
        session.progress.current_step,
        session.progress.total_steps,
        format_loss(session.progress.last_loss()),
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}
