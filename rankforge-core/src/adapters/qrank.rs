//! Quantized-rank adapter: quantize each target weight, then factor it into
//! `Q·R` at a rank set by the compression ratio.
//!
//! The forward pass reconstructs every target weight as `Q·R`; only `Q` and
//! `R` are trained. A periodic hook inspects factor norms and flags layers
//! whose factors have collapsed as rank-reduction candidates. The hook only
//! records and logs them, it never changes a rank.

use crate::adapters::probe::probe;
use crate::adapters::{
    AdapterReport, AdapterState, Evaluation, ModelAdapter, StepOutput, adapter_rng, state_mismatch,
};
use crate::config::{DecompositionSettings, EngineConfig};
use crate::data::{Batch, Dataset};
use crate::decomposition::{DecompositionStrategy, RefinedLowRank, relative_error};
use crate::error::EngineError;
use crate::model::BaseModel;
use crate::quantize::{QuantizationMode, quantize};
use crate::tensor::{BufferTracker, TensorData, TrackedBuffer, frobenius_norm, from_matrix_view, to_matrix_view};
use crate::training::optimizer::Optimizer;
use crate::training::progress::AdapterMetrics;
use crate::training::session::{ModelConfiguration, ModelType, QrConfig};
use ndarray::{Array2, ArrayD};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// `max(1, min(m, n, ⌊min(m, n) · ratio⌋))`
pub fn target_rank(rows: usize, cols: usize, compression_ratio: f32) -> usize {
    let min_dim = rows.min(cols);
    let scaled = (min_dim as f32 * compression_ratio).floor() as usize;
    scaled.min(min_dim).max(1)
}

#[derive(Debug)]
struct FactoredWeight {
    layer: String,
    weight: String,
    shape: Vec<usize>,
    original_size: usize,
    /// Relative residual of `Q·R` against the quantized matrix after refinement.
    reconstruction_error: f32,
    q: TrackedBuffer,
    r: TrackedBuffer,
}

impl FactoredWeight {
    fn key(&self) -> String {
        format!("{}.{}", self.layer, self.weight)
    }

    fn rank(&self) -> usize {
        self.q.shape()[1]
    }

    fn compressed_size(&self) -> usize {
        self.q.len() + self.r.len()
    }

    fn product(&self) -> Result<Array2<f32>, EngineError> {
        Ok(self.q.matrix()?.dot(&self.r.matrix()?))
    }
}

/// Per-weight compression bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerCompression {
    pub parameter: String,
    pub shape: Vec<usize>,
    pub rank: usize,
    pub original_size: usize,
    pub compressed_size: usize,
    pub compression_ratio: f64,
    pub reconstruction_error: f32,
}

/// Totals plus the per-layer breakdown. Layer sizes sum to the totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionAnalysis {
    pub quantization: QuantizationMode,
    pub total_original_size: usize,
    pub total_compressed_size: usize,
    /// `total_compressed_size / total_original_size`; 1.0 when nothing is adapted.
    pub compression_ratio: f64,
    pub layers: Vec<LayerCompression>,
}

/// A layer whose factor norms fell below the candidate threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankCandidate {
    pub parameter: String,
    pub step: usize,
    pub rank: usize,
    pub q_norm: f32,
    pub r_norm: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrWeightState {
    pub layer: String,
    pub weight: String,
    pub shape: Vec<usize>,
    pub reconstruction_error: f32,
    pub q: TensorData,
    pub r: TensorData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrState {
    pub quantization: QuantizationMode,
    pub weights: Vec<QrWeightState>,
}

pub struct QuantizedRankAdapter {
    config: QrConfig,
    strategy: Box<dyn DecompositionStrategy>,
    candidate_threshold: f32,
    hook_interval: usize,
    tracker: BufferTracker,
    rng: StdRng,
    weights: Vec<FactoredWeight>,
    candidates: Vec<RankCandidate>,
    hook_runs: usize,
    initialized: bool,
}

impl QuantizedRankAdapter {
    pub fn new(
        config: QrConfig,
        settings: &DecompositionSettings,
        hook_interval: usize,
        tracker: BufferTracker,
        seed: Option<u64>,
    ) -> Self {
        let iterations = config.refine_iterations.unwrap_or(settings.refine_iterations);
        Self {
            strategy: Box::new(RefinedLowRank::new(
                settings.init_scale,
                iterations,
                settings.refine_learning_rate,
            )),
            config,
            candidate_threshold: settings.candidate_norm_threshold,
            hook_interval,
            tracker,
            rng: adapter_rng(seed),
            weights: Vec::new(),
            candidates: Vec::new(),
            hook_runs: 0,
            initialized: false,
        }
    }

    pub fn from_config(config: &ModelConfiguration, engine: &EngineConfig) -> Result<Self, EngineError> {
        let qr = config
            .qr_config
            .clone()
            .ok_or_else(|| EngineError::configuration("quantized-rank adapter requires qrConfig"))?;
        Ok(Self::new(
            qr,
            &engine.decomposition,
            engine.training.rank_hook_interval_steps,
            BufferTracker::new(engine.resources.max_buffer_bytes),
            config.seed,
        ))
    }

    pub fn with_strategy(mut self, strategy: Box<dyn DecompositionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn tracker(&self) -> &BufferTracker {
        &self.tracker
    }

    /// Most recent rank-reduction candidates.
    pub fn rank_candidates(&self) -> &[RankCandidate] {
        &self.candidates
    }

    /// How many times the rank hook has run.
    pub fn hook_runs(&self) -> usize {
        self.hook_runs
    }

    /// `Q·R` in the weight's original shape.
    pub fn reconstructed_weight(&self, layer: &str, weight: &str) -> Result<ArrayD<f32>, EngineError> {
        let w = self
            .weights
            .iter()
            .find(|w| w.layer == layer && w.weight == weight)
            .ok_or_else(|| EngineError::not_found(format!("factored weight {layer}.{weight}")))?;
        from_matrix_view(w.product()?, &w.shape)
    }

    pub fn compression_analysis(&self) -> CompressionAnalysis {
        let layers: Vec<LayerCompression> = self
            .weights
            .iter()
            .map(|w| LayerCompression {
                parameter: w.key(),
                shape: w.shape.clone(),
                rank: w.rank(),
                original_size: w.original_size,
                compressed_size: w.compressed_size(),
                compression_ratio: ratio(w.compressed_size(), w.original_size),
                reconstruction_error: w.reconstruction_error,
            })
            .collect();
        let total_original_size = layers.iter().map(|l| l.original_size).sum();
        let total_compressed_size = layers.iter().map(|l| l.compressed_size).sum();
        CompressionAnalysis {
            quantization: self.config.quantization,
            total_original_size,
            total_compressed_size,
            compression_ratio: ratio(total_compressed_size, total_original_size),
            layers,
        }
    }

    /// Flag layers whose `‖Q‖` or `‖R‖` fell below the candidate threshold.
    pub fn inspect_rank_candidates(&mut self, step: usize) -> &[RankCandidate] {
        let threshold = self.candidate_threshold;
        let candidates: Vec<RankCandidate> = self
            .weights
            .iter()
            .filter_map(|w| {
                let q_norm = frobenius_norm(w.q.view().iter());
                let r_norm = frobenius_norm(w.r.view().iter());
                (q_norm < threshold || r_norm < threshold).then(|| RankCandidate {
                    parameter: w.key(),
                    step,
                    rank: w.rank(),
                    q_norm,
                    r_norm,
                })
            })
            .collect();
        for c in &candidates {
            warn!(
                parameter = %c.parameter,
                step,
                rank = c.rank,
                q_norm = c.q_norm,
                r_norm = c.r_norm,
                "Rank-reduction candidate"
            );
        }
        self.hook_runs += 1;
        self.candidates = candidates;
        &self.candidates
    }

    fn ensure_initialized(&self) -> Result<(), EngineError> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineError::training("quantized-rank adapter used before initialize"))
        }
    }
}

fn ratio(compressed: usize, original: usize) -> f64 {
    if original == 0 {
        1.0
    } else {
        compressed as f64 / original as f64
    }
}

impl ModelAdapter for QuantizedRankAdapter {
    fn kind(&self) -> ModelType {
        ModelType::QuantizedRank
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self, base: &BaseModel) -> Result<(), EngineError> {
        self.dispose();
        let targets = self.config.target_modules.clone();
        let mut weights = Vec::new();
        for layer in base.layers.iter().filter(|l| l.matches_any(&targets)) {
            for tensor in &layer.weights {
                let quantized = quantize(&tensor.value, self.config.quantization);
                let matrix = to_matrix_view(&quantized)?;
                let (m, n) = matrix.dim();
                let rank = target_rank(m, n, self.config.compression_ratio);
                let factors = self.strategy.factorize(&matrix, rank, &mut self.rng);
                let reconstruction_error = relative_error(&matrix, &factors);
                debug!(
                    layer = %layer.name,
                    weight = %tensor.name,
                    rows = m,
                    cols = n,
                    rank,
                    reconstruction_error,
                    "Factored quantized weight"
                );
                weights.push(FactoredWeight {
                    layer: layer.name.clone(),
                    weight: tensor.name.clone(),
                    shape: tensor.value.shape().to_vec(),
                    original_size: tensor.value.len(),
                    reconstruction_error,
                    q: self.tracker.track_matrix(factors.left)?,
                    r: self.tracker.track_matrix(factors.right)?,
                });
            }
        }
        if weights.is_empty() {
            warn!(
                model = %base.name,
                targets = ?targets,
                "No layer matched the target modules; adapter adapts nothing"
            );
        }
        self.weights = weights;
        self.initialized = true;
        let analysis = self.compression_analysis();
        info!(
            model = %base.name,
            quantization = %self.config.quantization,
            layers = analysis.layers.len(),
            compression_ratio = analysis.compression_ratio,
            strategy = self.strategy.name(),
            "Quantized-rank adapter initialized"
        );
        Ok(())
    }

    fn train_step(
        &mut self,
        batch: Batch<'_>,
        optimizer: &mut Optimizer,
        lr: f32,
    ) -> Result<StepOutput, EngineError> {
        self.ensure_initialized()?;
        if self.weights.is_empty() {
            return Ok(StepOutput {
                loss: 0.0,
                accuracy: 0.0,
            });
        }
        let share = 1.0 / self.weights.len() as f32;
        let mut loss = 0.0;
        let mut accuracy = 0.0;
        for weight in &mut self.weights {
            let q = weight.q.matrix()?;
            let r = weight.r.matrix()?;
            let result = probe(&q.dot(&r), batch);
            loss += result.loss * share;
            accuracy += result.accuracy * share;

            let grad = result.grad * share;
            let d_q = grad.dot(&r.t());
            let d_r = q.t().dot(&grad);
            let key = weight.key();
            optimizer.update(&format!("{key}.q"), weight.q.view_mut(), &d_q.into_dyn(), lr)?;
            optimizer.update(&format!("{key}.r"), weight.r.view_mut(), &d_r.into_dyn(), lr)?;
        }
        debug!(loss, accuracy, lr, "quantized-rank step");
        Ok(StepOutput { loss, accuracy })
    }

    fn evaluate(&mut self, data: &Dataset, batch_size: usize) -> Result<Evaluation, EngineError> {
        self.ensure_initialized()?;
        if self.weights.is_empty() || data.is_empty() {
            return Ok(Evaluation {
                loss: 0.0,
                accuracy: 0.0,
            });
        }
        let products: Vec<Array2<f32>> = self
            .weights
            .iter()
            .map(|w| w.product())
            .collect::<Result<_, _>>()?;
        let (mut loss, mut accuracy) = (0.0, 0.0);
        for batch in data.minibatches(batch_size) {
            let weight = batch.len() as f32 / (data.len() * products.len()) as f32;
            for matrix in &products {
                let result = probe(matrix, batch);
                loss += result.loss * weight;
                accuracy += result.accuracy * weight;
            }
        }
        Ok(Evaluation { loss, accuracy })
    }

    fn metrics(&self) -> AdapterMetrics {
        AdapterMetrics {
            live_bytes: self.tracker.live_bytes(),
            trainable_parameters: self.weights.iter().map(|w| w.compressed_size()).sum(),
            total_parameters: self.weights.iter().map(|w| w.original_size).sum(),
        }
    }

    fn after_step(&mut self, step: usize) {
        if self.hook_interval > 0 && step > 0 && step % self.hook_interval == 0 {
            self.inspect_rank_candidates(step);
        }
    }

    fn checkpoint(&self) -> Result<AdapterState, EngineError> {
        Ok(AdapterState::QuantizedRank(QrState {
            quantization: self.config.quantization,
            weights: self
                .weights
                .iter()
                .map(|w| QrWeightState {
                    layer: w.layer.clone(),
                    weight: w.weight.clone(),
                    shape: w.shape.clone(),
                    reconstruction_error: w.reconstruction_error,
                    q: TensorData::from_array(w.q.view()),
                    r: TensorData::from_array(w.r.view()),
                })
                .collect(),
        }))
    }

    fn restore(&mut self, state: &AdapterState) -> Result<(), EngineError> {
        let AdapterState::QuantizedRank(state) = state else {
            return Err(state_mismatch(ModelType::QuantizedRank, state));
        };
        if !self.initialized {
            return Err(EngineError::configuration(
                "initialize the adapter before restoring a checkpoint",
            ));
        }
        if state.quantization != self.config.quantization {
            return Err(EngineError::configuration(format!(
                "checkpoint was quantized as {} but the adapter uses {}",
                state.quantization, self.config.quantization
            )));
        }

        let mut decoded = Vec::with_capacity(state.weights.len());
        for ws in &state.weights {
            let index = self
                .weights
                .iter()
                .position(|w| w.layer == ws.layer && w.weight == ws.weight && w.shape == ws.shape)
                .ok_or_else(|| {
                    EngineError::configuration(format!(
                        "checkpoint references unknown weight {}.{} {:?}",
                        ws.layer, ws.weight, ws.shape
                    ))
                })?;
            let q = ws.q.to_matrix()?;
            let r = ws.r.to_matrix()?;
            let current = &self.weights[index];
            let (m, n) = (current.q.shape()[0], current.r.shape()[1]);
            if q.nrows() != m || r.ncols() != n || q.ncols() != r.nrows() {
                return Err(EngineError::configuration(format!(
                    "checkpoint factors for {} do not fit a {m}x{n} weight",
                    current.key()
                )));
            }
            decoded.push((index, q, r, ws.reconstruction_error));
        }

        for (index, q, r, error) in decoded {
            let weight = &mut self.weights[index];
            weight.q = self.tracker.track_matrix(q)?;
            weight.r = self.tracker.track_matrix(r)?;
            weight.reconstruction_error = error;
        }
        Ok(())
    }

    fn report(&self) -> AdapterReport {
        AdapterReport::QuantizedRank {
            analysis: self.compression_analysis(),
            candidates: self.candidates.clone(),
        }
    }

    fn dispose(&mut self) {
        if !self.weights.is_empty() {
            debug!(weights = self.weights.len(), "Releasing quantized-rank buffers");
        }
        self.weights.clear();
        self.candidates.clear();
        self.initialized = false;
    }
}
