//! Training progress and derived run metrics.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Progress markers and history for a session.
///
/// Zeroed at creation, mutated only by the training driver while a run is
/// active, frozen once the session reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingProgress {
    pub current_epoch: usize,
    pub total_epochs: usize,
    pub current_step: usize,
    pub total_steps: usize,
    pub loss_history: Vec<f32>,
    pub accuracy_history: Vec<f32>,
    pub learning_rate_history: Vec<f32>,
    #[serde(default)]
    pub validation_loss: Option<f32>,
    #[serde(default)]
    pub validation_accuracy: Option<f32>,
    /// Seconds.
    pub estimated_time_remaining: f64,
    pub completion_percentage: f64,
}

impl TrainingProgress {
    pub fn new(total_epochs: usize) -> Self {
        Self {
            current_epoch: 0,
            total_epochs,
            current_step: 0,
            total_steps: 0,
            loss_history: Vec::new(),
            accuracy_history: Vec::new(),
            learning_rate_history: Vec::new(),
            validation_loss: None,
            validation_accuracy: None,
            estimated_time_remaining: 0.0,
            completion_percentage: 0.0,
        }
    }

    /// Recompute the completion percentage from the step counters.
    ///
    /// Never moves backwards while a run is active.
    pub fn update_completion(&mut self) {
        if self.total_steps == 0 {
            return;
        }
        let pct = (self.current_step as f64 / self.total_steps as f64 * 100.0).clamp(0.0, 100.0);
        self.completion_percentage = self.completion_percentage.max(pct);
    }

    /// `(total - done) / (done / elapsed)`, clamped to zero.
    pub fn update_eta(&mut self, steps_this_run: usize, elapsed: Duration) {
        let remaining = self.total_steps.saturating_sub(self.current_step) as f64;
        let secs = elapsed.as_secs_f64();
        if steps_this_run == 0 || secs <= 0.0 {
            return;
        }
        let rate = steps_this_run as f64 / secs;
        self.estimated_time_remaining = (remaining / rate).max(0.0);
    }

    /// Final markers for a completed run.
    pub fn mark_complete(&mut self) {
        self.current_step = self.total_steps;
        self.current_epoch = self.total_epochs;
        self.completion_percentage = 100.0;
        self.estimated_time_remaining = 0.0;
    }

    /// Roll the markers back to a checkpoint, dropping later history.
    pub fn rewind_to(&mut self, epoch: usize, step: usize) {
        self.current_epoch = epoch.min(self.total_epochs);
        self.current_step = step;
        self.loss_history.truncate(step);
        self.accuracy_history.truncate(step);
        self.learning_rate_history.truncate(step);
        self.completion_percentage = if self.total_steps > 0 {
            (step as f64 / self.total_steps as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.estimated_time_remaining = 0.0;
    }

    pub fn last_loss(&self) -> Option<f32> {
        self.loss_history.last().copied()
    }

    pub fn last_accuracy(&self) -> Option<f32> {
        self.accuracy_history.last().copied()
    }
}

/// Ephemeral run metrics, recomputed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingMetrics {
    /// Steps per second.
    pub training_speed: f64,
    /// MiB held by tracked adapter buffers.
    pub memory_usage: f64,
    /// Share of wall time spent computing steps, percent.
    pub cpu_usage: f64,
    pub gpu_usage: f64,
    pub batch_size: usize,
    /// Samples per second.
    pub throughput: f64,
    /// Relative loss reduction since the first recorded step.
    pub convergence_rate: f64,
    /// Trainable share of all parameters, percent.
    pub efficiency: f64,
}

/// Adapter-side numbers folded into [`TrainingMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterMetrics {
    pub live_bytes: usize,
    pub trainable_parameters: usize,
    pub total_parameters: usize,
}

/// Accumulates timing for one run and produces [`TrainingMetrics`].
#[derive(Debug)]
pub struct MetricsTracker {
    started: Instant,
    busy: Duration,
    steps: usize,
    samples: usize,
    batch_size: usize,
    first_loss: Option<f32>,
}

impl MetricsTracker {
    pub fn new(batch_size: usize) -> Self {
        Self {
            started: Instant::now(),
            busy: Duration::ZERO,
            steps: 0,
            samples: 0,
            batch_size,
            first_loss: None,
        }
    }

    pub fn record_step(&mut self, samples: usize, compute: Duration, loss: f32) {
        self.steps += 1;
        self.samples += samples;
        self.busy += compute;
        if self.first_loss.is_none() {
            self.first_loss = Some(loss);
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self, latest_loss: Option<f32>, adapter: AdapterMetrics) -> TrainingMetrics {
        let secs = self.elapsed().as_secs_f64().max(f64::EPSILON);
        let convergence_rate = match (self.first_loss, latest_loss) {
            (Some(first), Some(last)) if first > 0.0 => ((first - last) / first) as f64,
            _ => 0.0,
        };
        let efficiency = if adapter.total_parameters > 0 {
            adapter.trainable_parameters as f64 / adapter.total_parameters as f64 * 100.0
        } else {
            0.0
        };
        TrainingMetrics {
            training_speed: self.steps as f64 / secs,
            memory_usage: adapter.live_bytes as f64 / (1024.0 * 1024.0),
            cpu_usage: (self.busy.as_secs_f64() / secs * 100.0).clamp(0.0, 100.0),
            gpu_usage: 0.0,
            batch_size: self.batch_size,
            throughput: self.samples as f64 / secs,
            convergence_rate,
            efficiency,
        }
    }
}
