//! End-to-end tests for the session orchestrator.
//!
//! Each test drives real adapters over small synthetic models and data
//! through the public `Orchestrator` API, observing the run through a
//! `RecordingCallback`.

use async_trait::async_trait;
use rankforge_core::adapters::classifier::{Tokenizer, encode_corpus};
use rankforge_core::adapters::{AdapterReport, AdapterState};
use rankforge_core::config::EngineConfig;
use rankforge_core::data::{Dataset, TrainingData};
use rankforge_core::error::EngineError;
use rankforge_core::model::BaseModel;
use rankforge_core::orchestrator::{Orchestrator, TrainingInputs};
use rankforge_core::persistence::{InMemoryStore, JsonFileStore, SessionStore};
use rankforge_core::training::{
    BertConfig, ModelConfiguration, ModelType, RecordingCallback, RunEnd, TrainingCallback,
    TrainingMetrics, TrainingProgress, TrainingStatus,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

fn orchestrator_with(config: EngineConfig) -> Orchestrator {
    Orchestrator::new(Arc::new(InMemoryStore::new()), config)
}

fn transformer_inputs(samples: usize) -> TrainingInputs {
    TrainingInputs::new(
        BaseModel::synthetic_transformer(16, 1, 7),
        TrainingData::new(Dataset::synthetic(samples, 8, 64, 3, 11), None),
    )
}

/// Records events and wakes a waiter on the first progress event.
struct SignallingCallback {
    recorder: RecordingCallback,
    first_progress: Notify,
}

impl SignallingCallback {
    fn new() -> Self {
        Self {
            recorder: RecordingCallback::new(),
            first_progress: Notify::new(),
        }
    }
}

#[async_trait]
impl TrainingCallback for SignallingCallback {
    async fn on_progress(&self, session_id: &str, progress: &TrainingProgress, metrics: &TrainingMetrics) {
        self.recorder.on_progress(session_id, progress, metrics).await;
        self.first_progress.notify_one();
    }

    async fn on_complete(&self, session_id: &str, progress: &TrainingProgress) {
        self.recorder.on_complete(session_id, progress).await;
    }

    async fn on_error(&self, session_id: &str, message: &str) {
        self.recorder.on_error(session_id, message).await;
    }

    async fn on_paused(&self, session_id: &str, progress: &TrainingProgress) {
        self.recorder.on_paused(session_id, progress).await;
    }
}

#[tokio::test]
async fn test_decomposition_session_emits_one_event_per_epoch() {
    let orch = orchestrator_with(EngineConfig::default());
    let config = ModelConfiguration::dora(8, vec!["q_proj".into()])
        .with_epochs(3)
        .with_batch_size(32)
        .with_seed(3);
    let session = orch.create_session("dora-a", ModelType::Dora, config).await.unwrap();
    let recorder = Arc::new(RecordingCallback::new());

    let started = orch.start(&session.id, transformer_inputs(64), recorder.clone()).await.unwrap();
    assert_eq!(started.status, TrainingStatus::Running);
    assert_eq!(started.progress.total_steps, 6);

    let done = orch.wait(&session.id).await.unwrap();
    assert_eq!(done.status, TrainingStatus::Completed);
    assert_eq!(done.progress.current_epoch, 3);
    assert_eq!(done.progress.current_step, 6);
    assert_eq!(done.progress.loss_history.len(), 6);

    let epochs: Vec<usize> = recorder.epoch_events().await.iter().map(|p| p.current_epoch).collect();
    assert_eq!(epochs, vec![1, 2, 3]);
    match recorder.ends().await.as_slice() {
        [RunEnd::Completed(progress)] => assert_eq!(progress.completion_percentage, 100.0),
        other => panic!("expected a single completion, got {other:?}"),
    }

    let AdapterReport::Dora { weights, .. } = orch.adapter_report(&session.id).await.unwrap() else {
        panic!("expected a decomposition report");
    };
    assert_eq!(weights.len(), 1);
}

#[tokio::test]
async fn test_stop_on_pending_session_is_invalid_state() {
    let orch = orchestrator_with(EngineConfig::default());
    let session = orch
        .create_session("pending", ModelType::Dora, ModelConfiguration::dora(4, vec!["q_proj".into()]))
        .await
        .unwrap();

    let err = orch.stop(&session.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: TrainingStatus::Pending,
            ..
        }
    ));
    assert_eq!(orch.get_session(&session.id).await.unwrap().status, TrainingStatus::Pending);
}

#[tokio::test]
async fn test_checkpoint_before_any_step() {
    let orch = orchestrator_with(EngineConfig::default());
    let session = orch
        .create_session("fresh", ModelType::Dora, ModelConfiguration::dora(4, vec!["q_proj".into()]))
        .await
        .unwrap();

    let reference = orch.create_checkpoint(&session.id, "before training").await.unwrap();
    assert_eq!((reference.epoch, reference.step), (0, 0));
    assert_eq!(orch.get_session(&session.id).await.unwrap().status, TrainingStatus::Pending);

    let checkpoint = orch.load_checkpoint(&session.id, &reference.id).await.unwrap();
    assert!(checkpoint.verify().unwrap());
    assert_eq!(checkpoint.description, "before training");
    assert!(matches!(checkpoint.state, AdapterState::Dora(_)));
    assert_eq!(orch.list_checkpoints(&session.id).await.unwrap(), vec![reference]);
}

#[tokio::test]
async fn test_stop_pauses_and_silences_the_run() {
    let mut config = EngineConfig::default();
    config.training.progress_interval_steps = 1;
    let orch = orchestrator_with(config);
    let model = ModelConfiguration::dora(4, vec!["q_proj".into()])
        .with_epochs(2)
        .with_batch_size(4)
        .with_seed(5);
    let session = orch.create_session("stoppable", ModelType::Dora, model).await.unwrap();
    let callback = Arc::new(SignallingCallback::new());

    orch.start(&session.id, transformer_inputs(200), callback.clone()).await.unwrap();
    callback.first_progress.notified().await;
    let paused = orch.stop(&session.id).await.unwrap();

    assert_eq!(paused.status, TrainingStatus::Paused);
    assert!(paused.progress.current_step >= 1);
    assert!(paused.progress.current_step < paused.progress.total_steps);
    assert!(!orch.is_running(&session.id).await);

    let events = callback.recorder.progress_events().await;
    let last = events.last().map(|(p, _)| p.current_step).unwrap();
    assert!(last <= paused.progress.current_step);
    assert!(matches!(callback.recorder.ends().await.as_slice(), [RunEnd::Paused(_)]));

    tokio::task::yield_now().await;
    assert_eq!(callback.recorder.progress_events().await.len(), events.len());

    // Pausing records a checkpoint and releases the adapter.
    assert_eq!(paused.checkpoints.len(), 1);
    assert_eq!(paused.checkpoints[0].step, paused.progress.current_step);
    assert!(matches!(orch.adapter_report(&session.id).await, Err(EngineError::NotFound(_))));

    let err = orch.stop(&session.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn test_paused_session_resumes_after_reopen() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(JsonFileStore::new(dir.path()));
    let mut config = EngineConfig::default();
    config.training.progress_interval_steps = 1;

    let orch = Orchestrator::new(store.clone(), config.clone());
    let model = ModelConfiguration::dora(4, vec!["q_proj".into()])
        .with_epochs(1)
        .with_batch_size(4)
        .with_seed(9);
    let session = orch.create_session("resumable", ModelType::Dora, model).await.unwrap();
    let first = Arc::new(SignallingCallback::new());
    orch.start(&session.id, transformer_inputs(120), first.clone()).await.unwrap();
    first.first_progress.notified().await;
    let paused = orch.stop(&session.id).await.unwrap();
    let paused_step = paused.progress.current_step;
    assert_eq!(paused.status, TrainingStatus::Paused);

    let reopened = Orchestrator::open(store, config).await.unwrap();
    let stored = reopened.get_session(&session.id).await.unwrap();
    assert_eq!(stored.status, TrainingStatus::Paused);
    assert_eq!(stored.progress.current_step, paused_step);

    let second = Arc::new(RecordingCallback::new());
    let resumed = reopened.start(&session.id, transformer_inputs(120), second.clone()).await.unwrap();
    assert_eq!(resumed.progress.current_step, paused_step);
    let done = reopened.wait(&session.id).await.unwrap();

    assert_eq!(done.status, TrainingStatus::Completed);
    assert_eq!(done.progress.current_step, done.progress.total_steps);
    assert_eq!(done.progress.loss_history.len(), done.progress.total_steps);
    let first_resumed = second.progress_events().await.first().map(|(p, _)| p.current_step).unwrap();
    assert_eq!(first_resumed, paused_step + 1);
}

#[tokio::test]
async fn test_restore_rewinds_a_paused_session() {
    let mut config = EngineConfig::default();
    config.training.progress_interval_steps = 1;
    let orch = orchestrator_with(config);
    let model = ModelConfiguration::dora(4, vec!["q_proj".into()])
        .with_epochs(1)
        .with_batch_size(4)
        .with_seed(2);
    let session = orch.create_session("rewind", ModelType::Dora, model).await.unwrap();
    let origin = orch.create_checkpoint(&session.id, "origin").await.unwrap();

    let callback = Arc::new(SignallingCallback::new());
    orch.start(&session.id, transformer_inputs(120), callback.clone()).await.unwrap();
    callback.first_progress.notified().await;
    orch.stop(&session.id).await.unwrap();

    let rewound = orch.restore_checkpoint(&session.id, &origin.id).await.unwrap();
    assert_eq!(rewound.status, TrainingStatus::Paused);
    assert_eq!(rewound.progress.current_step, 0);
    assert!(rewound.progress.loss_history.is_empty());
    assert_eq!(rewound.resume_from.as_deref(), Some(origin.id.as_str()));

    let restarted = orch
        .start(&session.id, transformer_inputs(120), Arc::new(RecordingCallback::new()))
        .await
        .unwrap();
    assert_eq!(restarted.progress.current_step, 0);
    assert!(restarted.resume_from.is_none());
    assert_eq!(orch.wait(&session.id).await.unwrap().status, TrainingStatus::Completed);
}

#[tokio::test]
async fn test_quantized_rank_session_reports_compression() {
    let orch = orchestrator_with(EngineConfig::default());
    let model = ModelConfiguration::quantized_rank(
        rankforge_core::quantize::QuantizationMode::Int8,
        0.5,
        vec!["attn".into()],
    )
    .with_epochs(1)
    .with_batch_size(8)
    .with_seed(4);
    let session = orch.create_session("qr", ModelType::QuantizedRank, model).await.unwrap();
    orch.start(&session.id, transformer_inputs(16), Arc::new(RecordingCallback::new()))
        .await
        .unwrap();
    assert_eq!(orch.wait(&session.id).await.unwrap().status, TrainingStatus::Completed);

    let AdapterReport::QuantizedRank { analysis, .. } = orch.adapter_report(&session.id).await.unwrap() else {
        panic!("expected a compression report");
    };
    // Four 16x16 attention projections at rank 8.
    assert_eq!(analysis.layers.len(), 4);
    assert!(analysis.layers.iter().all(|l| l.rank == 8));
    assert_eq!(analysis.total_original_size, 4 * 256);
    assert_eq!(
        analysis.total_compressed_size,
        analysis.layers.iter().map(|l| l.compressed_size).sum::<usize>()
    );
}

#[tokio::test]
async fn test_classifier_session_trains_and_classifies() {
    let bert = BertConfig {
        max_length: 12,
        hidden_size: 8,
        num_layers: 1,
        intermediate_size: 16,
        categories: vec!["sports".into(), "business".into()],
    };
    let tokenizer = Tokenizer::new();
    let corpus: Vec<(String, usize)> = [
        ("the team won the match", 0),
        ("coach says the season is over", 0),
        ("football league championship game", 0),
        ("stock market shares rise", 1),
        ("company profit and revenue up", 1),
        ("investors and the bank deal", 1),
    ]
    .iter()
    .map(|(text, label)| (text.to_string(), *label))
    .collect();
    let data = encode_corpus(&tokenizer, &bert, &corpus).unwrap();

    let orch = orchestrator_with(EngineConfig::default());
    let model = ModelConfiguration::sequence_classifier(bert)
        .with_epochs(2)
        .with_batch_size(3)
        .with_seed(8);
    let session = orch.create_session("news", ModelType::SequenceClassifier, model).await.unwrap();

    // Text classification needs a live adapter.
    assert!(matches!(
        orch.classify(&session.id, "team wins").await,
        Err(EngineError::NotFound(_))
    ));

    let recorder = Arc::new(RecordingCallback::new());
    orch.start(
        &session.id,
        TrainingInputs::new(BaseModel::new("none"), TrainingData::new(data.clone(), Some(data))),
        recorder.clone(),
    )
    .await
    .unwrap();
    let done = orch.wait(&session.id).await.unwrap();
    assert_eq!(done.status, TrainingStatus::Completed, "error: {:?}", done.error);
    assert!(done.progress.loss_history.iter().all(|l| l.is_finite()));
    assert!(done.progress.validation_loss.is_some());

    let prediction = orch.classify(&session.id, "the team won the cup").await.unwrap();
    assert!(["sports", "business"].contains(&prediction.category.as_str()));
    let total: f32 = prediction.probabilities.iter().sum();
    assert!((total - 1.0).abs() < 1e-4);

    let AdapterReport::SequenceClassifier(summary) = orch.adapter_report(&session.id).await.unwrap() else {
        panic!("expected a classifier summary");
    };
    assert!(summary.initialized);
    assert!(summary.parameters > 0);
}

#[tokio::test]
async fn test_mismatched_configuration_is_rejected_at_create() {
    let orch = orchestrator_with(EngineConfig::default());
    let err = orch
        .create_session(
            "mismatch",
            ModelType::QuantizedRank,
            ModelConfiguration::dora(4, vec!["q_proj".into()]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
    assert!(orch.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_delete_running_session_is_refused() {
    let mut config = EngineConfig::default();
    config.training.progress_interval_steps = 1;
    let orch = orchestrator_with(config);
    let model = ModelConfiguration::dora(4, vec!["q_proj".into()])
        .with_epochs(1)
        .with_batch_size(4)
        .with_seed(6);
    let session = orch.create_session("busy", ModelType::Dora, model).await.unwrap();
    let callback = Arc::new(SignallingCallback::new());
    orch.start(&session.id, transformer_inputs(120), callback.clone()).await.unwrap();
    callback.first_progress.notified().await;

    let err = orch.delete_session(&session.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    orch.shutdown().await;
    assert_eq!(orch.get_session(&session.id).await.unwrap().status, TrainingStatus::Paused);
    orch.delete_session(&session.id).await.unwrap();
    assert!(matches!(orch.get_session(&session.id).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_checkpoint_of_rewound_session_matches_its_markers() {
    let mut config = EngineConfig::default();
    config.training.progress_interval_steps = 1;
    let orch = orchestrator_with(config);
    let model = ModelConfiguration::dora(4, vec!["q_proj".into()])
        .with_epochs(1)
        .with_batch_size(4)
        .with_seed(12);
    let session = orch.create_session("relabel", ModelType::Dora, model).await.unwrap();

    let first = Arc::new(SignallingCallback::new());
    orch.start(&session.id, transformer_inputs(200), first.clone()).await.unwrap();
    first.first_progress.notified().await;
    let early = orch.stop(&session.id).await.unwrap().checkpoints[0].clone();

    let second = Arc::new(SignallingCallback::new());
    orch.start(&session.id, transformer_inputs(200), second.clone()).await.unwrap();
    second.first_progress.notified().await;
    let paused = orch.stop(&session.id).await.unwrap();
    let late = paused.checkpoints.last().unwrap().clone();
    assert!(late.step > early.step);

    let rewound = orch.restore_checkpoint(&session.id, &early.id).await.unwrap();
    assert_eq!(rewound.progress.current_step, early.step);

    let snapshot = orch.create_checkpoint(&session.id, "after rewind").await.unwrap();
    assert_eq!((snapshot.epoch, snapshot.step), (early.epoch, early.step));
    assert_eq!(snapshot.loss, early.loss);

    let snapshot_state = orch.load_checkpoint(&session.id, &snapshot.id).await.unwrap().state;
    let early_state = orch.load_checkpoint(&session.id, &early.id).await.unwrap().state;
    let late_state = orch.load_checkpoint(&session.id, &late.id).await.unwrap().state;
    assert_eq!(snapshot_state, early_state);
    assert_ne!(snapshot_state, late_state);
}

#[tokio::test]
async fn test_checkpoint_without_stored_state_starts_at_origin() {
    let mut config = EngineConfig::default();
    config.training.progress_interval_steps = 1;
    config.training.pause_checkpoint = false;
    let orch = orchestrator_with(config);
    let model = ModelConfiguration::dora(4, vec!["q_proj".into()])
        .with_epochs(1)
        .with_batch_size(4)
        .with_seed(13);
    let session = orch.create_session("unsaved", ModelType::Dora, model).await.unwrap();

    let callback = Arc::new(SignallingCallback::new());
    orch.start(&session.id, transformer_inputs(200), callback.clone()).await.unwrap();
    callback.first_progress.notified().await;
    let paused = orch.stop(&session.id).await.unwrap();
    assert!(paused.progress.current_step >= 1);
    assert!(paused.checkpoints.is_empty());

    // The next start would restart from step 0, so the snapshot does too.
    let snapshot = orch.create_checkpoint(&session.id, "manual").await.unwrap();
    assert_eq!((snapshot.epoch, snapshot.step), (0, 0));
    assert!(snapshot.loss.is_none());
}
