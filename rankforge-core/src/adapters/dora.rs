//! Weight-decomposition adapter.
//!
//! Each targeted weight `W` is split into a magnitude and a direction and
//! adapted as `W' = magnitude ⊙ direction + W0`, where `W0` is a frozen copy
//! of the original. Only the magnitude and direction buffers are trainable.
//!
//! - 2-D and 4-D weights (4-D viewed as `out x in*kh*kw`): the magnitude is
//!   the Frobenius norm and the direction is a low-rank product `A·B`.
//! - Any other rank: the magnitude is the per-row norm and the direction is
//!   `W / magnitude`. These weights have no rank and are never resized.

use crate::adapters::probe::probe;
use crate::adapters::{
    AdapterReport, AdapterState, Evaluation, ModelAdapter, StepOutput, StructureChange,
    adapter_rng, state_mismatch,
};
use crate::config::{DecompositionSettings, EngineConfig};
use crate::data::{Batch, Dataset};
use crate::decomposition::{DecompositionStrategy, RandomLowRank};
use crate::error::EngineError;
use crate::model::{BaseModel, WeightTensor};
use crate::tensor::{
    BufferTracker, TensorData, TrackedBuffer, as_matrix, frobenius_norm, from_matrix_view,
    row_norms, to_matrix_view,
};
use crate::training::optimizer::Optimizer;
use crate::training::progress::AdapterMetrics;
use crate::training::session::{DoraConfig, ModelConfiguration, ModelType};
use ndarray::{Array2, ArrayD, IxDyn};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug)]
enum Direction {
    LowRank {
        left: TrackedBuffer,
        right: TrackedBuffer,
    },
    RowWise(TrackedBuffer),
    Released,
}

#[derive(Debug)]
struct DecomposedWeight {
    layer: String,
    weight: String,
    shape: Vec<usize>,
    /// Matrix view of `W0`.
    frozen: TrackedBuffer,
    /// `[1]` for low-rank weights, `[rows, 1]` for row-wise weights.
    magnitude: TrackedBuffer,
    direction: Direction,
}

impl DecomposedWeight {
    fn key(&self) -> String {
        format!("{}.{}", self.layer, self.weight)
    }

    fn dims(&self) -> (usize, usize) {
        let s = self.frozen.shape();
        (s[0], s[1])
    }

    fn rank(&self) -> Option<usize> {
        match &self.direction {
            Direction::LowRank { left, .. } => Some(left.shape()[1]),
            _ => None,
        }
    }

    fn released(&self) -> EngineError {
        EngineError::resource(format!("direction buffers for {} were released", self.key()))
    }

    fn direction_matrix(&self) -> Result<Array2<f32>, EngineError> {
        match &self.direction {
            Direction::LowRank { left, right } => Ok(left.matrix()?.dot(&right.matrix()?)),
            Direction::RowWise(direction) => direction.matrix(),
            Direction::Released => Err(self.released()),
        }
    }

    fn adapted_matrix(&self) -> Result<Array2<f32>, EngineError> {
        let direction = self.direction_matrix()?;
        let scaled = match &self.direction {
            Direction::LowRank { .. } => {
                let magnitude = self.magnitude.view().first().copied().unwrap_or(0.0);
                direction * magnitude
            }
            _ => &direction * &self.magnitude.matrix()?,
        };
        Ok(scaled + &self.frozen.matrix()?)
    }

    fn adapted(&self) -> Result<ArrayD<f32>, EngineError> {
        from_matrix_view(self.adapted_matrix()?, &self.shape)
    }

    /// Push the gradient of `W'` back into magnitude and direction.
    fn apply_gradient(
        &mut self,
        grad: &Array2<f32>,
        optimizer: &mut Optimizer,
        lr: f32,
    ) -> Result<(), EngineError> {
        let key = self.key();
        match &mut self.direction {
            Direction::LowRank { left, right } => {
                let a = left.matrix()?;
                let b = right.matrix()?;
                let magnitude = self.magnitude.view().first().copied().unwrap_or(0.0);
                let direction = a.dot(&b);

                let d_mag = (grad * &direction).sum();
                let d_left = grad.dot(&b.t()) * magnitude;
                let d_right = a.t().dot(grad) * magnitude;

                optimizer.update(
                    &format!("{key}.magnitude"),
                    self.magnitude.view_mut(),
                    &ArrayD::from_elem(IxDyn(&[1]), d_mag),
                    lr,
                )?;
                optimizer.update(&format!("{key}.left"), left.view_mut(), &d_left.into_dyn(), lr)?;
                optimizer.update(&format!("{key}.right"), right.view_mut(), &d_right.into_dyn(), lr)?;
            }
            Direction::RowWise(direction) => {
                let dir = direction.matrix()?;
                let magnitude = self.magnitude.matrix()?;
                let d_mag = Array2::from_shape_fn(magnitude.dim(), |(i, _)| grad.row(i).dot(&dir.row(i)));
                let d_dir = grad * &magnitude;

                optimizer.update(
                    &format!("{key}.magnitude"),
                    self.magnitude.view_mut(),
                    &d_mag.into_dyn(),
                    lr,
                )?;
                optimizer.update(&format!("{key}.direction"), direction.view_mut(), &d_dir.into_dyn(), lr)?;
            }
            Direction::Released => {
                return Err(EngineError::resource(format!(
                    "direction buffers for {key} were released"
                )));
            }
        }
        Ok(())
    }

    /// Replace the factors with ones of `new_rank`, releasing the old buffers first.
    ///
    /// Shrinking drops the trailing component; growing appends a random column
    /// to the left factor and a zero row to the right one, so the product is
    /// unchanged at the moment of growth.
    fn resize_rank(
        &mut self,
        new_rank: usize,
        scale: f32,
        rng: &mut StdRng,
        tracker: &BufferTracker,
    ) -> Result<(), EngineError> {
        let (left, right) = match std::mem::replace(&mut self.direction, Direction::Released) {
            Direction::LowRank { left, right } => (left, right),
            other => {
                self.direction = other;
                return Err(EngineError::configuration(format!(
                    "{} has no rank to adjust",
                    self.key()
                )));
            }
        };
        let old_left = as_matrix(left.into_inner())?;
        let old_right = as_matrix(right.into_inner())?;
        let rank = old_left.ncols();
        let (m, n) = (old_left.nrows(), old_right.ncols());

        let new_left = Array2::from_shape_fn((m, new_rank), |(i, j)| {
            if j < rank { old_left[[i, j]] } else { rng.gen_range(-scale..=scale) }
        });
        let new_right = Array2::from_shape_fn((new_rank, n), |(i, j)| {
            if i < rank { old_right[[i, j]] } else { 0.0 }
        });
        drop(old_left);
        drop(old_right);

        self.direction = Direction::LowRank {
            left: tracker.track_matrix(new_left)?,
            right: tracker.track_matrix(new_right)?,
        };
        Ok(())
    }

    fn trainable_len(&self) -> usize {
        self.magnitude.len()
            + match &self.direction {
                Direction::LowRank { left, right } => left.len() + right.len(),
                Direction::RowWise(direction) => direction.len(),
                Direction::Released => 0,
            }
    }

    fn to_state(&self) -> DoraWeightState {
        let (left, right, direction) = match &self.direction {
            Direction::LowRank { left, right } => (
                Some(TensorData::from_array(left.view())),
                Some(TensorData::from_array(right.view())),
                None,
            ),
            Direction::RowWise(direction) => (None, None, Some(TensorData::from_array(direction.view()))),
            Direction::Released => (None, None, None),
        };
        DoraWeightState {
            layer: self.layer.clone(),
            weight: self.weight.clone(),
            shape: self.shape.clone(),
            magnitude: TensorData::from_array(self.magnitude.view()),
            left,
            right,
            direction,
        }
    }
}

/// Serialized magnitude/direction buffers of one weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoraWeightState {
    pub layer: String,
    pub weight: String,
    pub shape: Vec<usize>,
    pub magnitude: TensorData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<TensorData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<TensorData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<TensorData>,
}

impl DoraWeightState {
    pub fn rank(&self) -> Option<usize> {
        self.left.as_ref().and_then(|l| l.shape.get(1).copied())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoraState {
    pub weights: Vec<DoraWeightState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoraWeightReport {
    pub parameter: String,
    pub shape: Vec<usize>,
    pub rank: Option<usize>,
    pub magnitude_norm: f32,
    pub direction_norm: f32,
}

pub struct DoraAdapter {
    config: DoraConfig,
    settings: DecompositionSettings,
    strategy: Box<dyn DecompositionStrategy>,
    tracker: BufferTracker,
    rng: StdRng,
    weights: Vec<DecomposedWeight>,
    initialized: bool,
}

impl DoraAdapter {
    pub fn new(config: DoraConfig, settings: DecompositionSettings, tracker: BufferTracker, seed: Option<u64>) -> Self {
        Self {
            strategy: Box::new(RandomLowRank::new(settings.init_scale)),
            config,
            settings,
            tracker,
            rng: adapter_rng(seed),
            weights: Vec::new(),
            initialized: false,
        }
    }

    pub fn from_config(config: &ModelConfiguration, engine: &EngineConfig) -> Result<Self, EngineError> {
        let dora = config
            .dora_config
            .clone()
            .ok_or_else(|| EngineError::configuration("dora adapter requires doraConfig"))?;
        Ok(Self::new(
            dora,
            engine.decomposition.clone(),
            BufferTracker::new(engine.resources.max_buffer_bytes),
            config.seed,
        ))
    }

    /// Swap the factorization used for low-rank directions.
    pub fn with_strategy(mut self, strategy: Box<dyn DecompositionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn tracker(&self) -> &BufferTracker {
        &self.tracker
    }

    pub fn adapted_count(&self) -> usize {
        self.weights.len()
    }

    /// Current rank per adapted weight; `None` for row-wise weights.
    pub fn ranks(&self) -> Vec<(String, Option<usize>)> {
        self.weights.iter().map(|w| (w.key(), w.rank())).collect()
    }

    /// `magnitude ⊙ direction + W0` in the weight's original shape.
    pub fn adapted_weight(&self, layer: &str, weight: &str) -> Result<ArrayD<f32>, EngineError> {
        self.find(layer, weight)?.adapted()
    }

    fn find(&self, layer: &str, weight: &str) -> Result<&DecomposedWeight, EngineError> {
        self.weights
            .iter()
            .find(|w| w.layer == layer && w.weight == weight)
            .ok_or_else(|| EngineError::not_found(format!("adapted weight {layer}.{weight}")))
    }

    fn ensure_initialized(&self) -> Result<(), EngineError> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineError::training("dora adapter used before initialize"))
        }
    }

    fn decompose(&mut self, layer: &str, tensor: &WeightTensor) -> Result<DecomposedWeight, EngineError> {
        let shape = tensor.value.shape().to_vec();
        let matrix = to_matrix_view(&tensor.value)?;
        let (m, n) = matrix.dim();

        let (magnitude, direction) = if matches!(shape.len(), 2 | 4) {
            let magnitude = frobenius_norm(matrix.iter());
            let rank = self.config.rank.min(m).min(n).max(1);
            let factors = self.strategy.factorize(&matrix, rank, &mut self.rng);
            (
                self.tracker.track(ArrayD::from_elem(IxDyn(&[1]), magnitude))?,
                Direction::LowRank {
                    left: self.tracker.track_matrix(factors.left)?,
                    right: self.tracker.track_matrix(factors.right)?,
                },
            )
        } else {
            let norms = row_norms(&matrix);
            let direction = Array2::from_shape_fn((m, n), |(i, j)| {
                let norm = norms[[i, 0]];
                if norm > 0.0 { matrix[[i, j]] / norm } else { 0.0 }
            });
            (
                self.tracker.track_matrix(norms)?,
                Direction::RowWise(self.tracker.track_matrix(direction)?),
            )
        };

        Ok(DecomposedWeight {
            layer: layer.to_string(),
            weight: tensor.name.clone(),
            shape,
            frozen: self.tracker.track_matrix(matrix)?,
            magnitude,
            direction,
        })
    }
}

impl ModelAdapter for DoraAdapter {
    fn kind(&self) -> ModelType {
        ModelType::Dora
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
                weights.push(self.decompose(&layer.name, tensor)?);
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
        info!(
            model = %base.name,
            adapted = self.weights.len(),
            rank = self.config.rank,
            strategy = self.strategy.name(),
            live_bytes = self.tracker.live_bytes(),
            "Weight-decomposition adapter initialized"
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
            let adapted = weight.adapted_matrix()?;
            let result = probe(&adapted, batch);
            loss += result.loss * share;
            accuracy += result.accuracy * share;
            weight.apply_gradient(&(result.grad * share), optimizer, lr)?;
        }
        debug!(loss, accuracy, lr, "dora step");
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
        let adapted: Vec<Array2<f32>> = self
            .weights
            .iter()
            .map(|w| w.adapted_matrix())
            .collect::<Result<_, _>>()?;
        let (mut loss, mut accuracy) = (0.0, 0.0);
        for batch in data.minibatches(batch_size) {
            let weight = batch.len() as f32 / (data.len() * adapted.len()) as f32;
            for matrix in &adapted {
                let result = probe(matrix, batch);
                loss += result.loss * weight;
                accuracy += result.accuracy * weight;
            }
        }
        Ok(Evaluation { loss, accuracy })
    }

    fn metrics(&self) -> AdapterMetrics {
        let trainable: usize = self.weights.iter().map(|w| w.trainable_len()).sum();
        let frozen: usize = self.weights.iter().map(|w| w.frozen.len()).sum();
        AdapterMetrics {
            live_bytes: self.tracker.live_bytes(),
            trainable_parameters: trainable,
            total_parameters: trainable + frozen,
        }
    }

    fn maybe_adjust_structure(&mut self, optimizer: &mut Optimizer) -> Result<Vec<StructureChange>, EngineError> {
        let mut changes = Vec::new();
        for weight in &mut self.weights {
            let Some(rank) = weight.rank() else {
                continue;
            };
            let (m, n) = weight.dims();
            let norm = frobenius_norm(weight.direction_matrix()?.iter());

            let target = if norm < self.settings.shrink_threshold {
                self.settings.clamp_rank(rank - 1).min(rank)
            } else if norm > self.settings.grow_threshold {
                self.settings.clamp_rank(rank + 1).min(m.min(n)).max(rank)
            } else {
                continue;
            };
            if target == rank {
                continue;
            }

            weight.resize_rank(target, self.settings.init_scale, &mut self.rng, &self.tracker)?;
            let key = weight.key();
            optimizer.forget(&format!("{key}.left"));
            optimizer.forget(&format!("{key}.right"));
            info!(
                parameter = %weight.key(),
                from = rank,
                to = target,
                direction_norm = norm,
                "Adjusted direction rank"
            );
            changes.push(StructureChange {
                parameter: weight.key(),
                from_rank: rank,
                to_rank: target,
                direction_norm: norm,
            });
        }
        Ok(changes)
    }

    fn checkpoint(&self) -> Result<AdapterState, EngineError> {
        Ok(AdapterState::Dora(DoraState {
            weights: self.weights.iter().map(|w| w.to_state()).collect(),
        }))
    }

    fn restore(&mut self, state: &AdapterState) -> Result<(), EngineError> {
        let AdapterState::Dora(state) = state else {
            return Err(state_mismatch(ModelType::Dora, state));
        };
        if !self.initialized {
            return Err(EngineError::configuration(
                "initialize the adapter before restoring a checkpoint",
            ));
        }

        // Decode and validate everything before touching live buffers.
        let mut decoded = Vec::with_capacity(state.weights.len());
        for ws in &state.weights {
            let index = self
                .weights
                .iter()
                .position(|w| w.layer == ws.layer && w.weight == ws.weight)
                .ok_or_else(|| {
                    EngineError::configuration(format!(
                        "checkpoint references unknown weight {}.{}",
                        ws.layer, ws.weight
                    ))
                })?;
            let current = &self.weights[index];
            if current.shape != ws.shape {
                return Err(EngineError::configuration(format!(
                    "checkpoint shape {:?} does not match {} shape {:?}",
                    ws.shape,
                    current.key(),
                    current.shape
                )));
            }
            let (m, n) = current.dims();
            let magnitude = ws.magnitude.to_array()?;
            let parts = match (&ws.left, &ws.right, &ws.direction, current.rank()) {
                (Some(left), Some(right), None, Some(_)) => {
                    let left = left.to_matrix()?;
                    let right = right.to_matrix()?;
                    if left.nrows() != m || right.ncols() != n || left.ncols() != right.nrows() {
                        return Err(EngineError::configuration(format!(
                            "checkpoint factors for {} do not fit a {m}x{n} weight",
                            current.key()
                        )));
                    }
                    (Some((left, right)), None)
                }
                (None, None, Some(direction), None) => {
                    let direction = direction.to_matrix()?;
                    if direction.dim() != (m, n) {
                        return Err(EngineError::configuration(format!(
                            "checkpoint direction for {} has the wrong shape",
                            current.key()
                        )));
                    }
                    (None, Some(direction))
                }
                _ => {
                    return Err(EngineError::configuration(format!(
                        "checkpoint layout for {} does not match the adapter",
                        current.key()
                    )));
                }
            };
            if magnitude.shape() != current.magnitude.shape() {
                return Err(EngineError::configuration(format!(
                    "checkpoint magnitude for {} has the wrong shape",
                    current.key()
                )));
            }
            decoded.push((index, magnitude, parts));
        }

        for (index, magnitude, parts) in decoded {
            let weight = &mut self.weights[index];
            weight.direction = Direction::Released;
            weight.magnitude = self.tracker.track(magnitude)?;
            weight.direction = match parts {
                (Some((left, right)), _) => Direction::LowRank {
                    left: self.tracker.track_matrix(left)?,
                    right: self.tracker.track_matrix(right)?,
                },
                (None, Some(direction)) => Direction::RowWise(self.tracker.track_matrix(direction)?),
                (None, None) => Direction::Released,
            };
        }
        Ok(())
    }

    fn report(&self) -> AdapterReport {
        let weights = self
            .weights
            .iter()
            .map(|w| DoraWeightReport {
                parameter: w.key(),
                shape: w.shape.clone(),
                rank: w.rank(),
                magnitude_norm: frobenius_norm(w.magnitude.view().iter()),
                direction_norm: w
                    .direction_matrix()
                    .map(|d| frobenius_norm(d.iter()))
                    .unwrap_or(0.0),
            })
            .collect();
        AdapterReport::Dora {
            alpha: self.config.alpha,
            weights,
        }
    }

    fn dispose(&mut self) {
        if !self.weights.is_empty() {
            debug!(weights = self.weights.len(), "Releasing dora buffers");
        }
        self.weights.clear();
        self.initialized = false;
    }
}
