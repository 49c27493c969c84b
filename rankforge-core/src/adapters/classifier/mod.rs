//! Sequence-classifier adapter: a small attention encoder trained end to end
//! on tokenized text and used to assign one of a fixed set of categories.

mod encoder;
mod tokenizer;

pub use encoder::{EncoderParams, EncoderShape, NamedTensor};
pub use tokenizer::{CLS_TOKEN_ID, MASK_TOKEN_ID, SEP_TOKEN_ID, Tokenizer, UNK_TOKEN_ID};

use crate::adapters::{
    AdapterReport, AdapterState, Evaluation, ModelAdapter, StepOutput, adapter_rng, state_mismatch,
};
use crate::config::EngineConfig;
use crate::data::{Batch, Dataset};
use crate::error::EngineError;
use crate::model::BaseModel;
use crate::tensor::{BufferTracker, Reservation};
use crate::training::optimizer::Optimizer;
use crate::training::progress::AdapterMetrics;
use crate::training::session::{BertConfig, ModelConfiguration, ModelType};
use encoder::argmax;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Name of the optional base-model layer whose weight seeds the token embedding.
pub const EMBEDDING_LAYER: &str = "embeddings";

/// Classification of one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub category: String,
    pub confidence: f32,
    /// One probability per configured category, in configuration order.
    pub probabilities: Vec<f32>,
}

/// Serialized encoder. `tensors` is empty for an adapter that was never initialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierState {
    pub vocab_size: usize,
    pub max_length: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub intermediate_size: usize,
    pub categories: Vec<String>,
    pub tensors: Vec<NamedTensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierSummary {
    pub vocab_size: usize,
    pub max_length: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub intermediate_size: usize,
    pub categories: Vec<String>,
    pub parameters: usize,
    pub initialized: bool,
}

/// Tokenize labelled texts into a dataset sized for `config`.
pub fn encode_corpus(
    tokenizer: &Tokenizer,
    config: &BertConfig,
    samples: &[(String, usize)],
) -> Result<Dataset, EngineError> {
    let (inputs, labels): (Vec<Vec<u32>>, Vec<usize>) = samples
        .iter()
        .map(|(text, label)| (tokenizer.encode(text, config.max_length), *label))
        .unzip();
    Dataset::new(inputs, labels, config.categories.len())
}

pub struct SequenceClassifierAdapter {
    config: BertConfig,
    dropout: f32,
    tokenizer: Tokenizer,
    tracker: BufferTracker,
    rng: StdRng,
    params: Option<EncoderParams>,
    reservation: Option<Reservation>,
}

impl SequenceClassifierAdapter {
    pub fn new(config: BertConfig, dropout: f32, tracker: BufferTracker, seed: Option<u64>) -> Self {
        Self {
            config,
            dropout,
            tokenizer: Tokenizer::new(),
            tracker,
            rng: adapter_rng(seed),
            params: None,
            reservation: None,
        }
    }

    pub fn from_config(config: &ModelConfiguration, engine: &EngineConfig) -> Result<Self, EngineError> {
        let bert = config
            .bert_config
            .clone()
            .ok_or_else(|| EngineError::configuration("sequence classifier requires bertConfig"))?;
        Ok(Self::new(
            bert,
            config.dropout,
            BufferTracker::new(engine.resources.max_buffer_bytes),
            config.seed,
        ))
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn tracker(&self) -> &BufferTracker {
        &self.tracker
    }

    pub fn shape(&self) -> EncoderShape {
        EncoderShape {
            vocab_size: self.tokenizer.vocab_size(),
            max_length: self.config.max_length,
            hidden: self.config.hidden_size,
            layers: self.config.num_layers,
            intermediate: self.config.intermediate_size,
            classes: self.config.categories.len(),
        }
    }

    fn encoder(&self) -> Result<&EncoderParams, EngineError> {
        self.params
            .as_ref()
            .ok_or_else(|| EngineError::training("sequence classifier used before initialize"))
    }

    fn check_label(&self, label: usize) -> Result<(), EngineError> {
        let classes = self.config.categories.len();
        if label >= classes {
            return Err(EngineError::training(format!(
                "label {label} out of range for {classes} categories"
            )));
        }
        Ok(())
    }

    /// Classify an already encoded sequence.
    pub fn predict(&self, ids: &[u32]) -> Result<Prediction, EngineError> {
        let encoder = self.encoder()?;
        let probs = encoder.forward(ids, None).probabilities;
        let best = argmax(&probs);
        Ok(Prediction {
            category: self.config.categories[best].clone(),
            confidence: probs[best],
            probabilities: probs.to_vec(),
        })
    }

    pub fn classify(&self, text: &str) -> Result<Prediction, EngineError> {
        self.predict(&self.tokenizer.encode(text, self.config.max_length))
    }

    fn seed_embeddings(&self, base: &BaseModel, params: &mut EncoderParams) -> Result<(), EngineError> {
        let Some(layer) = base.layer(EMBEDDING_LAYER) else {
            return Ok(());
        };
        let expected = [params.shape.vocab_size, params.shape.hidden];
        match layer.weights.first() {
            Some(w) if w.value.shape() == expected => {
                let matrix = crate::tensor::as_matrix(w.value.clone())?;
                params.token_embedding.assign(&matrix);
                debug!(model = %base.name, "Seeded token embedding from base model");
            }
            Some(w) => warn!(
                model = %base.name,
                shape = ?w.value.shape(),
                expected = ?expected,
                "Base embedding shape does not match the encoder; keeping random init"
            ),
            None => {}
        }
        Ok(())
    }
}

impl ModelAdapter for SequenceClassifierAdapter {
    fn kind(&self) -> ModelType {
        ModelType::SequenceClassifier
    }

    fn is_initialized(&self) -> bool {
        self.params.is_some()
    }

    fn initialize(&mut self, base: &BaseModel) -> Result<(), EngineError> {
        self.dispose();
        let shape = self.shape();
        let reservation = self
            .tracker
            .reserve(shape.parameter_count() * std::mem::size_of::<f32>())?;
        let mut params = EncoderParams::init(shape, &mut self.rng);
        self.seed_embeddings(base, &mut params)?;
        info!(
            model = %base.name,
            vocab = shape.vocab_size,
            hidden = shape.hidden,
            layers = shape.layers,
            categories = shape.classes,
            parameters = shape.parameter_count(),
            "Sequence classifier initialized"
        );
        self.params = Some(params);
        self.reservation = Some(reservation);
        Ok(())
    }

    fn train_step(
        &mut self,
        batch: Batch<'_>,
        optimizer: &mut Optimizer,
        lr: f32,
    ) -> Result<StepOutput, EngineError> {
        for &label in batch.labels {
            self.check_label(label)?;
        }
        let dropout = self.dropout;
        let params = self
            .params
            .as_mut()
            .ok_or_else(|| EngineError::training("sequence classifier used before initialize"))?;
        if batch.is_empty() {
            return Ok(StepOutput {
                loss: 0.0,
                accuracy: 0.0,
            });
        }

        let mut grads = params.zeros_like();
        let (mut loss, mut correct) = (0.0_f32, 0usize);
        for (ids, &label) in batch.inputs.iter().zip(batch.labels) {
            let cache = params.forward(ids, Some((dropout, &mut self.rng)));
            loss += cache.loss(label);
            if cache.predicted() == label {
                correct += 1;
            }
            params.backward(&cache, label, &mut grads);
        }
        let count = batch.len() as f32;
        grads.scale(1.0 / count);
        params.apply(&grads, optimizer, lr)?;

        let output = StepOutput {
            loss: loss / count,
            accuracy: correct as f32 / count,
        };
        debug!(loss = output.loss, accuracy = output.accuracy, lr, "classifier step");
        Ok(output)
    }

    fn evaluate(&mut self, data: &Dataset, _batch_size: usize) -> Result<Evaluation, EngineError> {
        let encoder = self.encoder()?;
        if data.is_empty() {
            return Ok(Evaluation {
                loss: 0.0,
                accuracy: 0.0,
            });
        }
        let (mut loss, mut correct) = (0.0_f32, 0usize);
        for (ids, &label) in data.inputs.iter().zip(&data.labels) {
            self.check_label(label)?;
            let cache = encoder.forward(ids, None);
            loss += cache.loss(label);
            if cache.predicted() == label {
                correct += 1;
            }
        }
        let count = data.len() as f32;
        Ok(Evaluation {
            loss: loss / count,
            accuracy: correct as f32 / count,
        })
    }

    fn metrics(&self) -> AdapterMetrics {
        let parameters = self.params.as_ref().map_or(0, EncoderParams::parameter_count);
        AdapterMetrics {
            live_bytes: self.tracker.live_bytes(),
            trainable_parameters: parameters,
            total_parameters: parameters,
        }
    }

    fn checkpoint(&self) -> Result<AdapterState, EngineError> {
        let shape = self.shape();
        Ok(AdapterState::SequenceClassifier(ClassifierState {
            vocab_size: shape.vocab_size,
            max_length: shape.max_length,
            hidden_size: shape.hidden,
            num_layers: shape.layers,
            intermediate_size: shape.intermediate,
            categories: self.config.categories.clone(),
            tensors: self.params.as_ref().map(EncoderParams::to_named).unwrap_or_default(),
        }))
    }

    fn restore(&mut self, state: &AdapterState) -> Result<(), EngineError> {
        let AdapterState::SequenceClassifier(state) = state else {
            return Err(state_mismatch(ModelType::SequenceClassifier, state));
        };
        let shape = self.shape();
        let saved = EncoderShape {
            vocab_size: state.vocab_size,
            max_length: state.max_length,
            hidden: state.hidden_size,
            layers: state.num_layers,
            intermediate: state.intermediate_size,
            classes: state.categories.len(),
        };
        if saved != shape || state.categories != self.config.categories {
            return Err(EngineError::configuration(format!(
                "checkpoint encoder {saved:?} does not match configured encoder {shape:?}"
            )));
        }
        let params = self.params.as_mut().ok_or_else(|| {
            EngineError::configuration("initialize the adapter before restoring a checkpoint")
        })?;
        if state.tensors.is_empty() {
            return Err(EngineError::configuration(
                "checkpoint was taken before the classifier was initialized",
            ));
        }
        params.load_named(&state.tensors)
    }

    fn report(&self) -> AdapterReport {
        let shape = self.shape();
        AdapterReport::SequenceClassifier(ClassifierSummary {
            vocab_size: shape.vocab_size,
            max_length: shape.max_length,
            hidden_size: shape.hidden,
            num_layers: shape.layers,
            intermediate_size: shape.intermediate,
            categories: self.config.categories.clone(),
            parameters: shape.parameter_count(),
            initialized: self.params.is_some(),
        })
    }

    fn predict_text(&self, text: &str) -> Result<Prediction, EngineError> {
        self.classify(text)
    }

    fn dispose(&mut self) {
        if self.params.take().is_some() {
            debug!("Releasing sequence classifier parameters");
        }
        self.reservation = None;
    }
}
