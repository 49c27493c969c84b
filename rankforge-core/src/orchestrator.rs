//! Session orchestration: the state machine, one training loop per session,
//! checkpoints and persistence.
//!
//! An [`Orchestrator`] is an explicit object; sessions, live adapters and
//! running loops are all owned by it. Lock order is adapter before session
//! map, matching the training loop, which publishes progress while holding
//! its adapter.

use crate::adapters::{AdapterReport, ModelAdapter, Prediction, create_adapter};
use crate::config::EngineConfig;
use crate::data::TrainingData;
use crate::error::EngineError;
use crate::model::BaseModel;
use crate::persistence::SessionStore;
use crate::training::callbacks::TrainingCallback;
use crate::training::checkpoint::{CheckpointRef, ModelCheckpoint};
use crate::training::driver::{self, ProgressSink, RunContext, RunOutcome, SharedAdapter};
use crate::training::progress::{TrainingMetrics, TrainingProgress};
use crate::training::session::{ModelConfiguration, ModelType, TrainingSession, TrainingStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a run trains on.
#[derive(Debug, Clone)]
pub struct TrainingInputs {
    pub base_model: BaseModel,
    pub data: TrainingData,
}

impl TrainingInputs {
    pub fn new(base_model: BaseModel, data: TrainingData) -> Self {
        Self { base_model, data }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Inner {
    store: Arc<dyn SessionStore>,
    config: EngineConfig,
    sessions: RwLock<HashMap<String, TrainingSession>>,
    adapters: Mutex<HashMap<String, SharedAdapter>>,
    runs: Mutex<HashMap<String, RunHandle>>,
}

/// Owns sessions and drives at most one training loop per session.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn SessionStore>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                sessions: RwLock::new(HashMap::new()),
                adapters: Mutex::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Load stored sessions. Sessions recorded as running belong to a run
    /// that no longer exists and come back paused.
    pub async fn open(store: Arc<dyn SessionStore>, config: EngineConfig) -> Result<Self, EngineError> {
        let orchestrator = Self::new(store, config);
        let stored = orchestrator.inner.store.list_sessions()?;
        let mut sessions = orchestrator.inner.sessions.write().await;
        for mut session in stored {
            if session.status == TrainingStatus::Running {
                session.transition(TrainingStatus::Paused, "recover")?;
                orchestrator.inner.store.save_session(&session)?;
                warn!(session_id = %session.id, "Recovered interrupted session as paused");
            }
            sessions.insert(session.id.clone(), session);
        }
        info!(sessions = sessions.len(), "Orchestrator opened");
        drop(sessions);
        Ok(orchestrator)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate and record a new pending session.
    pub async fn create_session(
        &self,
        name: &str,
        model_type: ModelType,
        configuration: ModelConfiguration,
    ) -> Result<TrainingSession, EngineError> {
        configuration.validate(model_type)?;
        let session = TrainingSession::new(name, model_type, configuration);
        self.inner.store.save_session(&session)?;
        self.inner
            .sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        info!(session_id = %session.id, name, model_type = %model_type, "Session created");
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<TrainingSession, EngineError> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("session {id}")))
    }

    /// All sessions, oldest first.
    pub async fn list_sessions(&self) -> Vec<TrainingSession> {
        let mut sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.inner.runs.lock().await.contains_key(id)
    }

    /// Start or resume a session's training loop.
    ///
    /// Returns once the session is `running` and the loop is spawned. A
    /// paused session resumes from `resume_from` or its latest checkpoint.
    /// Events stream to `callback` until `on_complete`, `on_paused` or
    /// `on_error`.
    pub async fn start(
        &self,
        id: &str,
        inputs: TrainingInputs,
        callback: Arc<dyn TrainingCallback>,
    ) -> Result<TrainingSession, EngineError> {
        let mut runs = self.inner.runs.lock().await;
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("session {id}")))?;
        if !session.status.can_start() || runs.contains_key(id) {
            return Err(EngineError::invalid_state(id, session.status, "start"));
        }
        inputs.data.train.validate()?;
        if inputs.data.train.is_empty() {
            return Err(EngineError::configuration("training data is empty"));
        }
        if let Some(validation) = &inputs.data.validation {
            validation.validate()?;
        }
        let adapter = create_adapter(session.model_type, &session.configuration, &self.inner.config)?;

        let resume = self.resume_point(session)?;

        let resuming = session.status == TrainingStatus::Paused;
        session.transition(TrainingStatus::Running, "start")?;
        session.error = None;
        session.resume_from = None;
        let config = session.configuration.clone();
        let progress = &mut session.progress;
        progress.total_epochs = config.epochs;
        progress.total_steps = inputs.data.train.batch_count(config.batch_size) * config.epochs;
        match &resume {
            Some(checkpoint) => progress.rewind_to(checkpoint.epoch, checkpoint.step),
            None => {
                if resuming && progress.current_step > 0 {
                    warn!(session_id = id, "No checkpoint to resume from; restarting from step 0");
                }
                progress.rewind_to(0, 0);
            }
        }
        let snapshot = session.clone();
        self.inner.store.save_session(&snapshot)?;
        drop(sessions);

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        runs.insert(
            id.to_string(),
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        info!(
            session_id = id,
            model_type = %snapshot.model_type,
            start_step = snapshot.progress.current_step,
            total_steps = snapshot.progress.total_steps,
            "Training started"
        );

        let inner = self.inner.clone();
        let mut run = SessionRun {
            id: id.to_string(),
            adapter: Some(adapter),
            config,
            progress: snapshot.progress.clone(),
            resume,
            inputs,
            cancel,
            callback: callback.clone(),
        };
        let task = {
            let inner = inner.clone();
            tokio::spawn(async move { run.execute(&inner).await })
        };
        let run_id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                inner.abandon_run(&run_id, callback.as_ref(), &e.to_string()).await;
            }
            inner.runs.lock().await.remove(&run_id);
            let _ = done_tx.send(true);
        });
        drop(runs);
        Ok(snapshot)
    }

    /// Request cooperative cancellation and wait for the loop to pause.
    ///
    /// Must not be called from inside a [`TrainingCallback`] of the same run.
    pub async fn stop(&self, id: &str) -> Result<TrainingSession, EngineError> {
        let status = self.get_session(id).await?.status;
        if status != TrainingStatus::Running {
            return Err(EngineError::invalid_state(id, status, "stop"));
        }
        let done = {
            let runs = self.inner.runs.lock().await;
            runs.get(id).map(|run| {
                run.cancel.cancel();
                run.done.clone()
            })
        };
        info!(session_id = id, "Stop requested");
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_session(id).await
    }

    /// Wait for the session's current run, if any, to end.
    pub async fn wait(&self, id: &str) -> Result<TrainingSession, EngineError> {
        let done = self.inner.runs.lock().await.get(id).map(|run| run.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_session(id).await
    }

    /// Remove a session, its checkpoints and any live adapter.
    pub async fn delete_session(&self, id: &str) -> Result<(), EngineError> {
        {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get(id)
                .ok_or_else(|| EngineError::not_found(format!("session {id}")))?;
            if session.status == TrainingStatus::Running {
                return Err(EngineError::invalid_state(id, session.status, "delete"));
            }
            sessions.remove(id);
        }
        if let Some(adapter) = self.inner.adapters.lock().await.remove(id) {
            adapter.lock().await.dispose();
        }
        self.inner.store.delete_checkpoints(id)?;
        self.inner.store.delete_session(id)?;
        info!(session_id = id, "Session deleted");
        Ok(())
    }

    /// The stored checkpoint the next `start` of `session` resumes from.
    ///
    /// A pending session starts fresh unless it was rewound to a checkpoint.
    fn resume_point(&self, session: &TrainingSession) -> Result<Option<ModelCheckpoint>, EngineError> {
        match &session.resume_from {
            Some(checkpoint_id) => self
                .inner
                .store
                .load_checkpoint(&session.id, checkpoint_id)?
                .map(Some)
                .ok_or_else(|| EngineError::not_found(format!("checkpoint {checkpoint_id}"))),
            None if session.status != TrainingStatus::Pending => {
                Ok(self.inner.store.list_checkpoints(&session.id)?.pop())
            }
            None => Ok(None),
        }
    }

    /// Snapshot progress markers and adapter state. Does not change status.
    ///
    /// Without a live adapter the snapshot copies the checkpoint the session
    /// would resume from, markers included. With nothing stored it holds an
    /// uninitialized adapter's empty state at step 0.
    pub async fn create_checkpoint(&self, id: &str, description: &str) -> Result<CheckpointRef, EngineError> {
        let session = self.get_session(id).await?;
        let live = self.inner.adapters.lock().await.get(id).cloned();
        let checkpoint = match live {
            Some(adapter) => {
                let adapter = adapter.lock().await;
                let state = adapter.checkpoint()?;
                let progress = self.get_session(id).await?.progress;
                ModelCheckpoint::capture(id, &progress, state, description)?
            }
            None => match self.resume_point(&session)? {
                Some(source) => source.duplicate(description),
                None => {
                    let state = create_adapter(session.model_type, &session.configuration, &self.inner.config)?
                        .checkpoint()?;
                    let origin = TrainingProgress::new(session.configuration.epochs);
                    ModelCheckpoint::capture(id, &origin, state, description)?
                }
            },
        };
        self.inner.store.save_checkpoint(&checkpoint)?;
        let reference = checkpoint.to_ref();
        let snapshot = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(format!("session {id}")))?;
            session.checkpoints.push(reference.clone());
            session.updated_at = Utc::now();
            session.clone()
        };
        self.inner.store.save_session(&snapshot)?;
        info!(
            session_id = id,
            checkpoint_id = %reference.id,
            epoch = reference.epoch,
            step = reference.step,
            size_bytes = reference.size_bytes,
            "Checkpoint created"
        );
        Ok(reference)
    }

    pub async fn list_checkpoints(&self, id: &str) -> Result<Vec<CheckpointRef>, EngineError> {
        Ok(self.get_session(id).await?.checkpoints)
    }

    pub async fn load_checkpoint(&self, id: &str, checkpoint_id: &str) -> Result<ModelCheckpoint, EngineError> {
        self.get_session(id).await?;
        self.inner
            .store
            .load_checkpoint(id, checkpoint_id)?
            .ok_or_else(|| EngineError::not_found(format!("checkpoint {checkpoint_id}")))
    }

    /// Roll a session back to a checkpoint.
    ///
    /// A completed session restores the state into its live adapter. A
    /// pending or paused session rewinds its progress markers and resumes
    /// from the checkpoint on the next `start`.
    pub async fn restore_checkpoint(&self, id: &str, checkpoint_id: &str) -> Result<TrainingSession, EngineError> {
        let session = self.get_session(id).await?;
        if matches!(session.status, TrainingStatus::Running | TrainingStatus::Failed) {
            return Err(EngineError::invalid_state(id, session.status, "restore"));
        }
        let checkpoint = self.load_checkpoint(id, checkpoint_id).await?;
        if !checkpoint.verify()? {
            return Err(EngineError::configuration(format!(
                "checkpoint {checkpoint_id} failed its integrity check"
            )));
        }
        if checkpoint.state.model_type() != session.model_type {
            return Err(EngineError::configuration(format!(
                "checkpoint holds {} state but session is {}",
                checkpoint.state.model_type(),
                session.model_type
            )));
        }

        if session.status == TrainingStatus::Completed {
            let adapter = self
                .inner
                .adapters
                .lock()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::not_found(format!("live adapter for session {id}")))?;
            adapter.lock().await.restore(&checkpoint.state)?;
            info!(session_id = id, checkpoint_id, "Restored checkpoint into live adapter");
            return self.get_session(id).await;
        }

        let snapshot = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(format!("session {id}")))?;
            if !session.status.can_start() {
                return Err(EngineError::invalid_state(id, session.status, "restore"));
            }
            session.progress.rewind_to(checkpoint.epoch, checkpoint.step);
            session.resume_from = Some(checkpoint.id.clone());
            session.updated_at = Utc::now();
            session.clone()
        };
        self.inner.store.save_session(&snapshot)?;
        info!(session_id = id, checkpoint_id, step = checkpoint.step, "Session rewound to checkpoint");
        Ok(snapshot)
    }

    async fn live_adapter(&self, id: &str) -> Result<SharedAdapter, EngineError> {
        self.get_session(id).await?;
        self.inner
            .adapters
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("live adapter for session {id}")))
    }

    /// Ranks, compression analysis or classifier summary of the live adapter.
    pub async fn adapter_report(&self, id: &str) -> Result<AdapterReport, EngineError> {
        let adapter = self.live_adapter(id).await?;
        let report = adapter.lock().await.report();
        Ok(report)
    }

    /// Classify text with a sequence-classifier session's live adapter.
    pub async fn classify(&self, id: &str, text: &str) -> Result<Prediction, EngineError> {
        let adapter = self.live_adapter(id).await?;
        let adapter = adapter.lock().await;
        adapter.predict_text(text)
    }

    /// Pause every running session and release all live adapters.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, watch::Receiver<bool>)> = {
            let runs = self.inner.runs.lock().await;
            runs.iter()
                .map(|(id, run)| {
                    run.cancel.cancel();
                    (id.clone(), run.done.clone())
                })
                .collect()
        };
        for (id, mut done) in handles {
            let _ = done.wait_for(|finished| *finished).await;
            debug!(session_id = %id, "Run drained");
        }
        let adapters: Vec<SharedAdapter> = self.inner.adapters.lock().await.drain().map(|(_, a)| a).collect();
        for adapter in adapters {
            adapter.lock().await.dispose();
        }
        info!("Orchestrator shut down");
    }
}

impl Inner {
    /// Fail a session whose run task died without reaching a terminal state.
    async fn abandon_run(&self, id: &str, callback: &dyn TrainingCallback, reason: &str) {
        if let Some(adapter) = self.adapters.lock().await.remove(id) {
            adapter.lock().await.dispose();
        }
        let message = format!("training run aborted: {reason}");
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(id) else {
                return;
            };
            if session.status != TrainingStatus::Running {
                return;
            }
            session.error = Some(message.clone());
            if let Err(e) = session.transition(TrainingStatus::Failed, "abort") {
                warn!(session_id = id, error = %e, "Unexpected terminal transition");
            }
            session.clone()
        };
        if let Err(e) = self.store.save_session(&snapshot) {
            warn!(session_id = id, error = %e, "Failed to persist session");
        }
        error!(session_id = id, error = %message, "Training run aborted");
        callback.on_error(id, &message).await;
    }
}

/// Publishes loop progress into the session map and the store.
struct SessionSink<'a> {
    inner: &'a Inner,
    id: &'a str,
}

#[async_trait]
impl ProgressSink for SessionSink<'_> {
    async fn update(&self, progress: &TrainingProgress, metrics: &TrainingMetrics) {
        if let Some(session) = self.inner.sessions.write().await.get_mut(self.id) {
            session.progress = progress.clone();
            session.metrics = Some(metrics.clone());
            session.updated_at = Utc::now();
        }
    }

    async fn persist(&self) {
        let snapshot = self.inner.sessions.read().await.get(self.id).cloned();
        if let Some(session) = snapshot {
            if let Err(e) = self.inner.store.save_session(&session) {
                warn!(session_id = self.id, error = %e, "Failed to persist progress snapshot");
            }
        }
    }
}

/// One spawned run of a session.
struct SessionRun {
    id: String,
    adapter: Option<Box<dyn ModelAdapter>>,
    config: ModelConfiguration,
    progress: TrainingProgress,
    resume: Option<ModelCheckpoint>,
    inputs: TrainingInputs,
    cancel: CancellationToken,
    callback: Arc<dyn TrainingCallback>,
}

impl SessionRun {
    async fn execute(&mut self, inner: &Inner) {
        let Some(adapter) = self.adapter.take() else {
            return;
        };
        let shared: SharedAdapter = Arc::new(Mutex::new(adapter));

        let setup = {
            let mut adapter = shared.lock().await;
            adapter.initialize(&self.inputs.base_model).and_then(|()| match &self.resume {
                Some(checkpoint) if checkpoint.step > 0 => {
                    debug!(session_id = %self.id, checkpoint_id = %checkpoint.id, "Restoring adapter state");
                    adapter.restore(&checkpoint.state)
                }
                _ => Ok(()),
            })
        };
        if let Err(error) = setup {
            self.fail(inner, &shared, self.progress.clone(), error).await;
            return;
        }
        inner.adapters.lock().await.insert(self.id.clone(), shared.clone());

        let sink = SessionSink { inner, id: &self.id };
        let outcome = driver::run(RunContext {
            session_id: &self.id,
            adapter: shared.clone(),
            data: &self.inputs.data,
            config: &self.config,
            settings: &inner.config.training,
            progress: self.progress.clone(),
            cancel: self.cancel.clone(),
            callback: self.callback.clone(),
            sink: &sink,
        })
        .await;

        match outcome {
            RunOutcome::Completed { progress, metrics } => self.complete(inner, progress, metrics).await,
            RunOutcome::Paused { progress } => self.pause(inner, &shared, progress).await,
            RunOutcome::Failed { progress, error } => self.fail(inner, &shared, progress, error).await,
        }
    }

    /// Store the final markers, let `apply` record outcome details, then
    /// take the terminal transition and persist.
    async fn finalize(
        &self,
        inner: &Inner,
        next: TrainingStatus,
        progress: &TrainingProgress,
        apply: impl FnOnce(&mut TrainingSession) + Send,
    ) {
        let snapshot = {
            let mut sessions = inner.sessions.write().await;
            let Some(session) = sessions.get_mut(&self.id) else {
                return;
            };
            session.progress = progress.clone();
            apply(session);
            if let Err(e) = session.transition(next, "finish") {
                warn!(session_id = %self.id, error = %e, "Unexpected terminal transition");
            }
            session.clone()
        };
        if let Err(e) = inner.store.save_session(&snapshot) {
            warn!(session_id = %self.id, error = %e, "Failed to persist session");
        }
    }

    async fn complete(&self, inner: &Inner, progress: TrainingProgress, metrics: TrainingMetrics) {
        self.finalize(inner, TrainingStatus::Completed, &progress, |session| {
            session.metrics = Some(metrics);
        })
        .await;
        info!(
            session_id = %self.id,
            steps = progress.current_step,
            loss = progress.last_loss().unwrap_or(f32::NAN),
            "Training completed"
        );
        self.callback.on_complete(&self.id, &progress).await;
    }

    async fn pause(&self, inner: &Inner, adapter: &SharedAdapter, progress: TrainingProgress) {
        let mut reference = None;
        {
            let mut adapter = adapter.lock().await;
            if inner.config.training.pause_checkpoint {
                let saved = adapter
                    .checkpoint()
                    .and_then(|state| ModelCheckpoint::capture(&self.id, &progress, state, "paused"))
                    .and_then(|checkpoint| {
                        inner.store.save_checkpoint(&checkpoint)?;
                        Ok(checkpoint.to_ref())
                    });
                match saved {
                    Ok(r) => reference = Some(r),
                    Err(e) => warn!(session_id = %self.id, error = %e, "Failed to checkpoint paused run"),
                }
            }
            adapter.dispose();
        }
        inner.adapters.lock().await.remove(&self.id);
        self.finalize(inner, TrainingStatus::Paused, &progress, |session| {
            session.checkpoints.extend(reference);
        })
        .await;
        info!(session_id = %self.id, step = progress.current_step, "Training paused");
        self.callback.on_paused(&self.id, &progress).await;
    }

    async fn fail(&self, inner: &Inner, adapter: &SharedAdapter, progress: TrainingProgress, error: EngineError) {
        adapter.lock().await.dispose();
        inner.adapters.lock().await.remove(&self.id);
        let message = error.to_string();
        let recorded = message.clone();
        self.finalize(inner, TrainingStatus::Failed, &progress, |session| {
            session.error = Some(recorded);
        })
        .await;
        error!(session_id = %self.id, step = progress.current_step, error = %message, "Training failed");
        self.callback.on_error(&self.id, &message).await;
    }
}
