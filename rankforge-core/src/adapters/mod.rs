//! Parameter-efficient adaptation strategies.
//!
//! Every strategy implements [`ModelAdapter`]; the orchestrator picks one by
//! [`ModelType`] through [`create_adapter`] and drives it with the shared
//! training loop. Adapters own their buffers exclusively and release them in
//! [`ModelAdapter::dispose`].

pub mod classifier;
pub mod dora;
pub mod probe;
pub mod qrank;

use crate::config::EngineConfig;
use crate::data::{Batch, Dataset};
use crate::error::EngineError;
use crate::model::BaseModel;
use crate::training::optimizer::Optimizer;
use crate::training::progress::AdapterMetrics;
use crate::training::session::{ModelConfiguration, ModelType};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

pub use classifier::{ClassifierState, ClassifierSummary, Prediction, SequenceClassifierAdapter};
pub use dora::{DoraAdapter, DoraState, DoraWeightReport};
pub use qrank::{
    CompressionAnalysis, LayerCompression, QrState, QuantizedRankAdapter, RankCandidate,
};

/// Result of a single optimization step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f32,
    pub accuracy: f32,
}

/// Loss and accuracy over a held-out set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
}

/// A structural change made between epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureChange {
    pub parameter: String,
    pub from_rank: usize,
    pub to_rank: usize,
    pub direction_norm: f32,
}

/// Serialized adapter parameters carried by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "adapter", rename_all = "snake_case")]
pub enum AdapterState {
    Dora(DoraState),
    QuantizedRank(QrState),
    SequenceClassifier(ClassifierState),
}

impl AdapterState {
    pub fn model_type(&self) -> ModelType {
        match self {
            Self::Dora(_) => ModelType::Dora,
            Self::QuantizedRank(_) => ModelType::QuantizedRank,
            Self::SequenceClassifier(_) => ModelType::SequenceClassifier,
        }
    }
}

/// Human-facing description of a live adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "adapter", rename_all = "snake_case")]
pub enum AdapterReport {
    Dora {
        alpha: f32,
        weights: Vec<DoraWeightReport>,
    },
    QuantizedRank {
        analysis: CompressionAnalysis,
        candidates: Vec<RankCandidate>,
    },
    SequenceClassifier(ClassifierSummary),
}

/// The contract every adaptation strategy fulfils.
///
/// Calls are synchronous; the training driver provides the suspension
/// points between them. Cancellation is owned by the driver, so adapters
/// never observe `stop` directly.
pub trait ModelAdapter: Send + Sync {
    fn kind(&self) -> ModelType;

    fn is_initialized(&self) -> bool;

    /// Bind to a base model. Re-initializing releases previous buffers first.
    fn initialize(&mut self, base: &BaseModel) -> Result<(), EngineError>;

    /// Forward, backward and optimizer update for one minibatch.
    fn train_step(
        &mut self,
        batch: Batch<'_>,
        optimizer: &mut Optimizer,
        lr: f32,
    ) -> Result<StepOutput, EngineError>;

    fn evaluate(&mut self, data: &Dataset, batch_size: usize) -> Result<Evaluation, EngineError>;

    fn metrics(&self) -> AdapterMetrics;

    /// Structural control run at the configured epoch cadence. A resized
    /// buffer's optimizer moments are dropped through `optimizer`.
    fn maybe_adjust_structure(&mut self, _optimizer: &mut Optimizer) -> Result<Vec<StructureChange>, EngineError> {
        Ok(Vec::new())
    }

    /// Called with the 1-based count of completed steps after every step.
    fn after_step(&mut self, _step: usize) {}

    fn checkpoint(&self) -> Result<AdapterState, EngineError>;

    fn restore(&mut self, state: &AdapterState) -> Result<(), EngineError>;

    fn report(&self) -> AdapterReport;

    fn predict_text(&self, _text: &str) -> Result<Prediction, EngineError> {
        Err(EngineError::configuration(format!(
            "{} adapters do not support text classification",
            self.kind()
        )))
    }

    /// Release every buffer the adapter owns.
    fn dispose(&mut self);
}

/// Build the adapter matching `model_type`.
pub fn create_adapter(
    model_type: ModelType,
    config: &ModelConfiguration,
    engine: &EngineConfig,
) -> Result<Box<dyn ModelAdapter>, EngineError> {
    config.validate(model_type)?;
    let adapter: Box<dyn ModelAdapter> = match model_type {
        ModelType::Dora => Box::new(DoraAdapter::from_config(config, engine)?),
        ModelType::QuantizedRank => Box::new(QuantizedRankAdapter::from_config(config, engine)?),
        ModelType::SequenceClassifier => {
            Box::new(SequenceClassifierAdapter::from_config(config, engine)?)
        }
    };
    Ok(adapter)
}

/// Seeded when the configuration carries a seed, entropy-seeded otherwise.
pub(crate) fn adapter_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

pub(crate) fn state_mismatch(expected: ModelType, state: &AdapterState) -> EngineError {
    EngineError::configuration(format!(
        "cannot restore {} state into a {expected} adapter",
        state.model_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::QuantizationMode;
    use crate::training::session::BertConfig;

    #[test]
    fn test_factory_selects_by_model_type() {
        let engine = EngineConfig::default();
        let dora = ModelConfiguration::dora(4, vec!["q_proj".into()]);
        assert_eq!(
            create_adapter(ModelType::Dora, &dora, &engine).unwrap().kind(),
            ModelType::Dora
        );

        let qr = ModelConfiguration::quantized_rank(QuantizationMode::Int8, 0.5, vec!["proj".into()]);
        assert_eq!(
            create_adapter(ModelType::QuantizedRank, &qr, &engine).unwrap().kind(),
            ModelType::QuantizedRank
        );

        let bert = ModelConfiguration::sequence_classifier(BertConfig::default());
        let adapter = create_adapter(ModelType::SequenceClassifier, &bert, &engine).unwrap();
        assert_eq!(adapter.kind(), ModelType::SequenceClassifier);
        assert!(!adapter.is_initialized());
    }

    #[test]
    fn test_factory_rejects_mismatched_block() {
        let engine = EngineConfig::default();
        let dora = ModelConfiguration::dora(4, vec!["q_proj".into()]);
        let err = create_adapter(ModelType::QuantizedRank, &dora, &engine).err().unwrap();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_state_tagging() {
        let state = AdapterState::Dora(DoraState { weights: Vec::new() });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["adapter"], "dora");
        let back: AdapterState = serde_json::from_value(json).unwrap();
        assert_eq!(back.model_type(), ModelType::Dora);
    }
}
