//! Training sessions, their status state machine and configuration snapshot.

use crate::error::EngineError;
use crate::quantize::QuantizationMode;
use crate::training::checkpoint::CheckpointRef;
use crate::training::progress::{TrainingMetrics, TrainingProgress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which adaptation strategy a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Magnitude/direction decomposition.
    Dora,
    /// Quantize, then factor into Q·R.
    QuantizedRank,
    /// Stacked attention encoder with a classifier head.
    SequenceClassifier,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dora => write!(f, "dora"),
            Self::QuantizedRank => write!(f, "quantized_rank"),
            Self::SequenceClassifier => write!(f, "sequence_classifier"),
        }
    }
}

impl std::str::FromStr for ModelType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "dora" | "weight_decomposition" => Ok(Self::Dora),
            "quantized_rank" | "qr" | "qr_adaptation" => Ok(Self::QuantizedRank),
            "sequence_classifier" | "bert" | "classifier" => Ok(Self::SequenceClassifier),
            other => Err(EngineError::configuration(format!("unknown model type '{other}'"))),
        }
    }
}

/// Session status.
///
/// `pending -> running -> {paused, completed, failed}`, `paused -> running`.
/// `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TrainingStatus {
    pub fn can_transition_to(&self, next: TrainingStatus) -> bool {
        use TrainingStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Paused, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, Self::Pending | Self::Paused)
    }
}

impl fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    #[serde(alias = "adam_w")]
    AdamW,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Cosine,
    Linear,
    Exponential,
}

/// Weight-decomposition adapter options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoraConfig {
    pub rank: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    pub target_modules: Vec<String>,
}

fn default_alpha() -> f32 {
    16.0
}

/// Quantized-rank adapter options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrConfig {
    pub quantization: QuantizationMode,
    pub compression_ratio: f32,
    pub target_modules: Vec<String>,
    /// Overrides the engine-wide refinement iteration count.
    #[serde(default)]
    pub refine_iterations: Option<usize>,
}

/// Sequence-classifier options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BertConfig {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            intermediate_size: default_intermediate_size(),
            categories: default_categories(),
        }
    }
}

fn default_max_length() -> usize {
    64
}

fn default_hidden_size() -> usize {
    32
}

fn default_num_layers() -> usize {
    2
}

fn default_intermediate_size() -> usize {
    64
}

fn default_categories() -> Vec<String> {
    ["technology", "science", "business", "health", "sports", "entertainment"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Immutable configuration snapshot attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfiguration {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub epochs: usize,
    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerKind,
    #[serde(default = "default_scheduler")]
    pub scheduler: SchedulerKind,
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default)]
    pub dropout: f32,
    /// Seed for random initialization. Entropy-seeded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dora_config: Option<DoraConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_config: Option<QrConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bert_config: Option<BertConfig>,
}

fn default_optimizer() -> OptimizerKind {
    OptimizerKind::AdamW
}

fn default_scheduler() -> SchedulerKind {
    SchedulerKind::Cosine
}

impl ModelConfiguration {
    fn base(learning_rate: f32, batch_size: usize, epochs: usize) -> Self {
        Self {
            learning_rate,
            batch_size,
            epochs,
            optimizer: default_optimizer(),
            scheduler: default_scheduler(),
            warmup_steps: 0,
            weight_decay: 0.0,
            dropout: 0.0,
            seed: None,
            dora_config: None,
            qr_config: None,
            bert_config: None,
        }
    }

    pub fn dora(rank: usize, target_modules: Vec<String>) -> Self {
        Self {
            dora_config: Some(DoraConfig {
                rank,
                alpha: default_alpha(),
                target_modules,
            }),
            ..Self::base(1e-3, 32, 3)
        }
    }

    pub fn quantized_rank(
        quantization: QuantizationMode,
        compression_ratio: f32,
        target_modules: Vec<String>,
    ) -> Self {
        Self {
            qr_config: Some(QrConfig {
                quantization,
                compression_ratio,
                target_modules,
                refine_iterations: None,
            }),
            ..Self::base(1e-3, 32, 3)
        }
    }

    pub fn sequence_classifier(bert: BertConfig) -> Self {
        Self {
            bert_config: Some(bert),
            ..Self::base(2e-3, 16, 3)
        }
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// The model type implied by the single adapter block present.
    pub fn inferred_model_type(&self) -> Option<ModelType> {
        match (&self.dora_config, &self.qr_config, &self.bert_config) {
            (Some(_), None, None) => Some(ModelType::Dora),
            (None, Some(_), None) => Some(ModelType::QuantizedRank),
            (None, None, Some(_)) => Some(ModelType::SequenceClassifier),
            _ => None,
        }
    }

    /// Check the configuration against the declared model type.
    pub fn validate(&self, model_type: ModelType) -> Result<(), EngineError> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(EngineError::configuration("learningRate must be positive"));
        }
        if self.batch_size == 0 {
            return Err(EngineError::configuration("batchSize must be at least 1"));
        }
        if self.epochs == 0 {
            return Err(EngineError::configuration("epochs must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(EngineError::configuration("dropout must be in [0, 1)"));
        }
        if self.weight_decay < 0.0 {
            return Err(EngineError::configuration("weightDecay must be non-negative"));
        }

        let blocks = [
            self.dora_config.is_some(),
            self.qr_config.is_some(),
            self.bert_config.is_some(),
        ];
        if blocks.iter().filter(|b| **b).count() != 1 {
            return Err(EngineError::configuration(
                "exactly one of doraConfig, qrConfig, bertConfig must be present",
            ));
        }
        if self.inferred_model_type() != Some(model_type) {
            return Err(EngineError::configuration(format!(
                "adapter configuration does not match model type {model_type}"
            )));
        }

        if let Some(dora) = &self.dora_config {
            if dora.rank == 0 {
                return Err(EngineError::configuration("doraConfig.rank must be at least 1"));
            }
            validate_targets(&dora.target_modules, "doraConfig")?;
        }
        if let Some(qr) = &self.qr_config {
            if !(qr.compression_ratio > 0.0 && qr.compression_ratio <= 1.0) {
                return Err(EngineError::configuration(
                    "qrConfig.compressionRatio must be in (0, 1]",
                ));
            }
            validate_targets(&qr.target_modules, "qrConfig")?;
        }
        if let Some(bert) = &self.bert_config {
            if bert.max_length < 2 {
                return Err(EngineError::configuration(
                    "bertConfig.maxLength must leave room for begin and end tokens",
                ));
            }
            if bert.hidden_size == 0 || bert.intermediate_size == 0 {
                return Err(EngineError::configuration(
                    "bertConfig hidden and intermediate sizes must be positive",
                ));
            }
            if bert.categories.len() < 2 {
                return Err(EngineError::configuration(
                    "bertConfig.categories needs at least two categories",
                ));
            }
        }
        Ok(())
    }
}

fn validate_targets(targets: &[String], block: &str) -> Result<(), EngineError> {
    if targets.is_empty() {
        return Err(EngineError::configuration(format!(
            "{block}.targetModules must name at least one module"
        )));
    }
    if targets.iter().any(|t| t.trim().is_empty()) {
        return Err(EngineError::configuration(format!(
            "{block}.targetModules contains an empty module name"
        )));
    }
    Ok(())
}

/// One end-to-end training run and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSession {
    pub id: String,
    pub name: String,
    pub model_type: ModelType,
    pub status: TrainingStatus,
    pub configuration: ModelConfiguration,
    pub progress: TrainingProgress,
    #[serde(default)]
    pub metrics: Option<TrainingMetrics>,
    /// Append-only, in creation order.
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRef>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Checkpoint the next `start` restores from instead of the latest one.
    #[serde(default)]
    pub resume_from: Option<String>,
}

impl TrainingSession {
    pub fn new(name: &str, model_type: ModelType, configuration: ModelConfiguration) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            model_type,
            status: TrainingStatus::Pending,
            progress: TrainingProgress::new(configuration.epochs),
            configuration,
            metrics: None,
            checkpoints: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            resume_from: None,
        }
    }

    /// Apply a status transition, refusing anything off the state graph.
    pub fn transition(&mut self, next: TrainingStatus, action: &str) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::invalid_state(&self.id, self.status, action));
        }
        let now = Utc::now();
        match next {
            TrainingStatus::Running if self.started_at.is_none() => self.started_at = Some(now),
            TrainingStatus::Completed | TrainingStatus::Failed => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
