//! The shared epoch/batch loop every adapter is trained with.
//!
//! The loop yields to the runtime after each minibatch and after each epoch.
//! Cancellation is cooperative: the token is polled at those boundaries, so
//! an in-flight batch always completes. Progress reaches the owner through a
//! [`ProgressSink`] after every step and reaches the caller's
//! [`TrainingCallback`] every `progress_interval_steps` steps and at each
//! epoch boundary.

use crate::adapters::ModelAdapter;
use crate::config::TrainingSettings;
use crate::data::TrainingData;
use crate::error::EngineError;
use crate::training::callbacks::TrainingCallback;
use crate::training::optimizer::{LrScheduler, Optimizer};
use crate::training::progress::{MetricsTracker, TrainingMetrics, TrainingProgress};
use crate::training::session::ModelConfiguration;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// An adapter shared between the running loop and the orchestrator.
pub type SharedAdapter = Arc<tokio::sync::Mutex<Box<dyn ModelAdapter>>>;

/// Where the loop publishes its state.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Latest markers, after every step and epoch boundary.
    async fn update(&self, progress: &TrainingProgress, metrics: &TrainingMetrics);

    /// Durable snapshot, throttled by `persist_interval_steps`.
    async fn persist(&self);
}

/// Everything one run needs.
pub struct RunContext<'a> {
    pub session_id: &'a str,
    pub adapter: SharedAdapter,
    pub data: &'a TrainingData,
    pub config: &'a ModelConfiguration,
    pub settings: &'a TrainingSettings,
    /// Starting markers. A non-zero `current_step` resumes mid-run.
    pub progress: TrainingProgress,
    pub cancel: CancellationToken,
    pub callback: Arc<dyn TrainingCallback>,
    pub sink: &'a dyn ProgressSink,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        progress: TrainingProgress,
        metrics: TrainingMetrics,
    },
    /// Stopped at a batch or epoch boundary after cancellation.
    Paused { progress: TrainingProgress },
    Failed {
        progress: TrainingProgress,
        error: EngineError,
    },
}

impl RunOutcome {
    pub fn progress(&self) -> &TrainingProgress {
        match self {
            Self::Completed { progress, .. } | Self::Paused { progress } | Self::Failed { progress, .. } => {
                progress
            }
        }
    }
}

/// Train `ctx.adapter` over `ctx.data` until completion, cancellation or error.
pub async fn run(ctx: RunContext<'_>) -> RunOutcome {
    let RunContext {
        session_id,
        adapter,
        data,
        config,
        settings,
        mut progress,
        cancel,
        callback,
        sink,
    } = ctx;

    let batch_size = config.batch_size;
    let steps_per_epoch = data.train.batch_count(batch_size);
    let total_steps = steps_per_epoch * config.epochs;
    progress.total_epochs = config.epochs;
    progress.total_steps = total_steps;
    if steps_per_epoch == 0 {
        return RunOutcome::Failed {
            progress,
            error: EngineError::training("training data is empty"),
        };
    }

    let start_step = progress.current_step.min(total_steps);
    let start_epoch = start_step / steps_per_epoch;
    let mut optimizer = Optimizer::from_config(config);
    let scheduler = LrScheduler::from_config(config, total_steps, steps_per_epoch);
    let mut tracker = MetricsTracker::new(batch_size);
    let deadline = settings.max_run_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    let emit_every = settings.progress_interval_steps.max(1);
    let persist_every = settings.persist_interval_steps.max(1);
    let mut step = start_step;

    info!(
        session_id,
        start_step,
        total_steps,
        steps_per_epoch,
        optimizer = ?optimizer.kind(),
        "Training loop started"
    );

    for epoch in start_epoch..config.epochs {
        let skip = if epoch == start_epoch { start_step % steps_per_epoch } else { 0 };
        for batch in data.train.minibatches(batch_size).skip(skip) {
            if cancel.is_cancelled() {
                debug!(session_id, step, "Cancellation observed at batch boundary");
                return RunOutcome::Paused { progress };
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let secs = settings.max_run_secs.unwrap_or_default();
                    return RunOutcome::Failed {
                        progress,
                        error: EngineError::training(format!("run exceeded its {secs}s deadline at step {step}")),
                    };
                }
            }

            let lr = scheduler.lr_at(step);
            let started = Instant::now();
            let metrics = {
                let mut adapter = adapter.lock().await;
                let output = match adapter.train_step(batch, &mut optimizer, lr) {
                    Ok(output) => output,
                    Err(error) => return RunOutcome::Failed { progress, error },
                };
                if !output.loss.is_finite() {
                    return RunOutcome::Failed {
                        progress,
                        error: EngineError::training(format!(
                            "non-finite loss {} at step {}",
                            output.loss,
                            step + 1
                        )),
                    };
                }
                step += 1;
                adapter.after_step(step);
                tracker.record_step(batch.len(), started.elapsed(), output.loss);

                progress.current_step = step;
                progress.loss_history.push(output.loss);
                progress.accuracy_history.push(output.accuracy);
                progress.learning_rate_history.push(lr);
                progress.update_completion();
                progress.update_eta(tracker.steps(), tracker.elapsed());
                let metrics = tracker.snapshot(progress.last_loss(), adapter.metrics());
                sink.update(&progress, &metrics).await;
                metrics
            };

            let epoch_end = step == (epoch + 1) * steps_per_epoch;
            if !epoch_end && step % emit_every == 0 && !cancel.is_cancelled() {
                callback.on_progress(session_id, &progress, &metrics).await;
            }
            if step % persist_every == 0 {
                sink.persist().await;
            }
            tokio::task::yield_now().await;
        }

        let metrics = {
            let mut adapter = adapter.lock().await;
            if let Some(validation) = &data.validation {
                match adapter.evaluate(validation, batch_size) {
                    Ok(eval) => {
                        progress.validation_loss = Some(eval.loss);
                        progress.validation_accuracy = Some(eval.accuracy);
                    }
                    Err(error) => return RunOutcome::Failed { progress, error },
                }
            }
            progress.current_epoch = epoch + 1;
            let interval = settings.structure_interval_epochs;
            if interval > 0 && (epoch + 1) % interval == 0 {
                match adapter.maybe_adjust_structure(&mut optimizer) {
                    Ok(changes) => {
                        if !changes.is_empty() {
                            debug!(
                                session_id,
                                tracked_parameters = optimizer.tracked_parameters(),
                                "Optimizer state after structure change"
                            );
                        }
                        for change in changes {
                            info!(
                                session_id,
                                epoch = epoch + 1,
                                parameter = %change.parameter,
                                from_rank = change.from_rank,
                                to_rank = change.to_rank,
                                direction_norm = change.direction_norm,
                                "Adjusted adapter rank"
                            );
                        }
                    }
                    Err(error) => return RunOutcome::Failed { progress, error },
                }
            }
            let metrics = tracker.snapshot(progress.last_loss(), adapter.metrics());
            sink.update(&progress, &metrics).await;
            metrics
        };

        debug!(
            session_id,
            epoch = progress.current_epoch,
            loss = progress.last_loss().unwrap_or(f32::NAN),
            validation_loss = ?progress.validation_loss,
            "Epoch finished"
        );
        if cancel.is_cancelled() {
            return RunOutcome::Paused { progress };
        }
        callback.on_progress(session_id, &progress, &metrics).await;
        sink.persist().await;
        tokio::task::yield_now().await;
    }

    progress.mark_complete();
    let metrics = {
        let adapter = adapter.lock().await;
        tracker.snapshot(progress.last_loss(), adapter.metrics())
    };
    sink.update(&progress, &metrics).await;
    RunOutcome::Completed { progress, metrics }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{StepOutput, create_adapter};
    use crate::config::EngineConfig;
    use crate::data::{Batch, Dataset};
    use crate::model::BaseModel;
    use crate::training::callbacks::RecordingCallback;
    use crate::training::session::ModelType;

    #[derive(Default)]
    struct CountingSink {
        updates: tokio::sync::Mutex<Vec<TrainingProgress>>,
        persists: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ProgressSink for CountingSink {
        async fn update(&self, progress: &TrainingProgress, _metrics: &TrainingMetrics) {
            self.updates.lock().await.push(progress.clone());
        }

        async fn persist(&self) {
            self.persists.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn dora_setup(epochs: usize) -> (SharedAdapter, TrainingData, ModelConfiguration) {
        let config = ModelConfiguration::dora(2, vec!["q_proj".into()])
            .with_epochs(epochs)
            .with_batch_size(4)
            .with_seed(3);
        let mut adapter = create_adapter(ModelType::Dora, &config, &EngineConfig::default()).unwrap();
        adapter.initialize(&BaseModel::synthetic_transformer(8, 1, 1)).unwrap();
        let data = TrainingData::new(Dataset::synthetic(16, 6, 64, 3, 9), Some(Dataset::synthetic(8, 6, 64, 3, 10)));
        (Arc::new(tokio::sync::Mutex::new(adapter)), data, config)
    }

    fn context<'a>(
        adapter: SharedAdapter,
        data: &'a TrainingData,
        config: &'a ModelConfiguration,
        settings: &'a TrainingSettings,
        callback: Arc<dyn TrainingCallback>,
        sink: &'a dyn ProgressSink,
        cancel: CancellationToken,
    ) -> RunContext<'a> {
        RunContext {
            session_id: "test",
            adapter,
            data,
            config,
            settings,
            progress: TrainingProgress::new(config.epochs),
            cancel,
            callback,
            sink,
        }
    }

    #[tokio::test]
    async fn test_run_completes_with_epoch_events() {
        let (adapter, data, config) = dora_setup(3);
        let settings = TrainingSettings::default();
        let recorder = Arc::new(RecordingCallback::new());
        let sink = CountingSink::default();
        let outcome = run(context(
            adapter,
            &data,
            &config,
            &settings,
            recorder.clone(),
            &sink,
            CancellationToken::new(),
        ))
        .await;

        let progress = match outcome {
            RunOutcome::Completed { progress, .. } => progress,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(progress.total_steps, 12);
        assert_eq!(progress.current_step, 12);
        assert_eq!(progress.completion_percentage, 100.0);
        assert_eq!(progress.estimated_time_remaining, 0.0);
        assert_eq!(progress.loss_history.len(), 12);
        assert!(progress.validation_loss.is_some());

        let epochs: Vec<usize> = recorder.epoch_events().await.iter().map(|p| p.current_epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3]);
        let updates = sink.updates.lock().await;
        assert!(updates.windows(2).all(|w| w[0].completion_percentage <= w[1].completion_percentage));
        assert_eq!(sink.persists.load(std::sync::atomic::Ordering::SeqCst), 3 + 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_pauses_without_events() {
        let (adapter, data, config) = dora_setup(2);
        let settings = TrainingSettings::default();
        let recorder = Arc::new(RecordingCallback::new());
        let sink = CountingSink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run(context(adapter, &data, &config, &settings, recorder.clone(), &sink, cancel)).await;
        assert!(matches!(outcome, RunOutcome::Paused { ref progress } if progress.current_step == 0));
        assert!(recorder.progress_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_completed_batches() {
        let (adapter, data, config) = dora_setup(2);
        let settings = TrainingSettings::default();
        let sink = CountingSink::default();
        let mut ctx = context(
            adapter,
            &data,
            &config,
            &settings,
            Arc::new(RecordingCallback::new()),
            &sink,
            CancellationToken::new(),
        );
        ctx.progress.current_step = 6;
        ctx.progress.current_epoch = 1;
        ctx.progress.loss_history = vec![1.0; 6];
        ctx.progress.accuracy_history = vec![0.0; 6];
        ctx.progress.learning_rate_history = vec![0.0; 6];
        let RunOutcome::Completed { progress, .. } = run(ctx).await else {
            panic!("expected completion");
        };
        assert_eq!(progress.loss_history.len(), 8);
        assert_eq!(sink.updates.lock().await.first().map(|p| p.current_step), Some(7));
    }

    struct Exploding;

    impl ModelAdapter for Exploding {
        fn kind(&self) -> ModelType {
            ModelType::Dora
        }
        fn is_initialized(&self) -> bool {
            true
        }
        fn initialize(&mut self, _base: &BaseModel) -> Result<(), EngineError> {
            Ok(())
        }
        fn train_step(&mut self, _batch: Batch<'_>, _opt: &mut Optimizer, _lr: f32) -> Result<StepOutput, EngineError> {
            Ok(StepOutput {
                loss: f32::NAN,
                accuracy: 0.0,
            })
        }
        fn evaluate(&mut self, _data: &Dataset, _bs: usize) -> Result<crate::adapters::Evaluation, EngineError> {
            unreachable!()
        }
        fn metrics(&self) -> crate::training::progress::AdapterMetrics {
            Default::default()
        }
        fn checkpoint(&self) -> Result<crate::adapters::AdapterState, EngineError> {
            Ok(crate::adapters::AdapterState::Dora(crate::adapters::DoraState { weights: Vec::new() }))
        }
        fn restore(&mut self, _state: &crate::adapters::AdapterState) -> Result<(), EngineError> {
            Ok(())
        }
        fn report(&self) -> crate::adapters::AdapterReport {
            crate::adapters::AdapterReport::Dora {
                alpha: 0.0,
                weights: Vec::new(),
            }
        }
        fn dispose(&mut self) {}
    }

    #[tokio::test]
    async fn test_non_finite_loss_fails_the_run() {
        let (_, data, config) = dora_setup(1);
        let boxed: Box<dyn ModelAdapter> = Box::new(Exploding);
        let adapter: SharedAdapter = Arc::new(tokio::sync::Mutex::new(boxed));
        let settings = TrainingSettings::default();
        let sink = CountingSink::default();
        let outcome = run(context(
            adapter,
            &data,
            &config,
            &settings,
            Arc::new(RecordingCallback::new()),
            &sink,
            CancellationToken::new(),
        ))
        .await;
        let RunOutcome::Failed { error, progress } = outcome else {
            panic!("expected failure");
        };
        assert!(matches!(error, EngineError::Training(_)));
        assert_eq!(progress.current_step, 0);
    }

    #[tokio::test]
    async fn test_deadline_fails_the_run() {
        let (adapter, data, config) = dora_setup(1);
        let settings = TrainingSettings {
            max_run_secs: Some(0),
            ..TrainingSettings::default()
        };
        let sink = CountingSink::default();
        let outcome = run(context(
            adapter,
            &data,
            &config,
            &settings,
            Arc::new(RecordingCallback::new()),
            &sink,
            CancellationToken::new(),
        ))
        .await;
        assert!(matches!(outcome, RunOutcome::Failed { error: EngineError::Training(_), .. }));
    }
}
