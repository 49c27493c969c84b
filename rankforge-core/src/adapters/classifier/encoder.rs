//! Attention encoder with a classification head and exact manual gradients.
//!
//! Per sequence: token + position embeddings, then `N` blocks of
//! `LN(x + Attn(x))` followed by `LN(y + FFN(y))`, then mean pooling over
//! non-padding positions and a softmax head. Attention is single-head
//! scaled dot-product with padding keys masked out. Layer normalization has
//! no learned gain or bias.

use crate::data::PAD_TOKEN_ID;
use crate::error::EngineError;
use crate::tensor::{TensorData, random_matrix, softmax_rows};
use crate::training::optimizer::Optimizer;
use ndarray::{Array1, Array2, Axis, Zip};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::tokenizer::UNK_TOKEN_ID;

const LN_EPS: f32 = 1e-5;
const MASKED_SCORE: f32 = -1e9;

/// Encoder dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderShape {
    pub vocab_size: usize,
    pub max_length: usize,
    pub hidden: usize,
    pub layers: usize,
    pub intermediate: usize,
    pub classes: usize,
}

impl EncoderShape {
    pub fn parameter_count(&self) -> usize {
        let d = self.hidden;
        let f = self.intermediate;
        let block = 4 * d * d + d * f + f + f * d + d;
        self.vocab_size * d + self.max_length * d + self.layers * block + d * self.classes + self.classes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockParams {
    pub wq: Array2<f32>,
    pub wk: Array2<f32>,
    pub wv: Array2<f32>,
    pub wo: Array2<f32>,
    /// `hidden x intermediate`
    pub w1: Array2<f32>,
    pub b1: Array1<f32>,
    /// `intermediate x hidden`
    pub w2: Array2<f32>,
    pub b2: Array1<f32>,
}

/// Borrowed view of one named parameter.
pub enum ParamRef<'a> {
    Vector(&'a Array1<f32>),
    Matrix(&'a Array2<f32>),
}

pub enum ParamMut<'a> {
    Vector(&'a mut Array1<f32>),
    Matrix(&'a mut Array2<f32>),
}

impl ParamMut<'_> {
    fn scale(self, factor: f32) {
        match self {
            Self::Vector(v) => v.mapv_inplace(|x| x * factor),
            Self::Matrix(m) => m.mapv_inplace(|x| x * factor),
        }
    }
}

/// Serialized parameter, keyed by its path inside the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: TensorData,
}

/// All trainable parameters. Gradients use the same type.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    pub shape: EncoderShape,
    /// `vocab x hidden`
    pub token_embedding: Array2<f32>,
    /// `max_length x hidden`
    pub position_embedding: Array2<f32>,
    pub blocks: Vec<BlockParams>,
    /// `hidden x classes`
    pub head_weight: Array2<f32>,
    pub head_bias: Array1<f32>,
}

struct BlockCache {
    input: Array2<f32>,
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    attention: Array2<f32>,
    attended: Array2<f32>,
    normed1: Array2<f32>,
    inv_std1: Array1<f32>,
    pre_activation: Array2<f32>,
    dropout_mask: Option<Array2<f32>>,
    activated: Array2<f32>,
    normed2: Array2<f32>,
    inv_std2: Array1<f32>,
}

/// Forward activations kept for the backward pass.
pub struct ForwardCache {
    tokens: Vec<usize>,
    pooled_rows: Vec<usize>,
    blocks: Vec<BlockCache>,
    pooled: Array1<f32>,
    pub probabilities: Array1<f32>,
}

impl ForwardCache {
    pub fn loss(&self, label: usize) -> f32 {
        -self.probabilities[label].max(1e-12).ln()
    }

    pub fn predicted(&self) -> usize {
        argmax(&self.probabilities)
    }
}

pub fn argmax(values: &Array1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

fn xavier(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
    let limit = (6.0 / (rows + cols) as f32).sqrt();
    random_matrix(rows, cols, limit, rng)
}

fn layer_norm(h: &Array2<f32>) -> (Array2<f32>, Array1<f32>) {
    let mut y = h.clone();
    let mut inv_std = Array1::<f32>::zeros(h.nrows());
    for (i, mut row) in y.axis_iter_mut(Axis(0)).enumerate() {
        let mean = row.mean().unwrap_or(0.0);
        let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / row.len().max(1) as f32;
        let s = 1.0 / (var + LN_EPS).sqrt();
        row.mapv_inplace(|v| (v - mean) * s);
        inv_std[i] = s;
    }
    (y, inv_std)
}

/// `dh = s · (dy - mean(dy) - y · mean(dy ⊙ y))`, row-wise.
fn layer_norm_backward(y: &Array2<f32>, inv_std: &Array1<f32>, dy: &Array2<f32>) -> Array2<f32> {
    let mut dh = Array2::<f32>::zeros(y.dim());
    for i in 0..y.nrows() {
        let yr = y.row(i);
        let dyr = dy.row(i);
        let n = yr.len().max(1) as f32;
        let mean_dy = dyr.sum() / n;
        let mean_dyy = dyr.dot(&yr) / n;
        let s = inv_std[i];
        let mut out = dh.row_mut(i);
        Zip::from(&mut out)
            .and(&yr)
            .and(&dyr)
            .for_each(|o, &yv, &dv| *o = s * (dv - mean_dy - yv * mean_dyy));
    }
    dh
}

impl EncoderParams {
    pub fn init(shape: EncoderShape, rng: &mut StdRng) -> Self {
        let d = shape.hidden;
        let f = shape.intermediate;
        let blocks = (0..shape.layers)
            .map(|_| BlockParams {
                wq: xavier(d, d, rng),
                wk: xavier(d, d, rng),
                wv: xavier(d, d, rng),
                wo: xavier(d, d, rng),
                w1: xavier(d, f, rng),
                b1: Array1::zeros(f),
                w2: xavier(f, d, rng),
                b2: Array1::zeros(d),
            })
            .collect();
        Self {
            shape,
            token_embedding: random_matrix(shape.vocab_size, d, 0.1, rng),
            position_embedding: random_matrix(shape.max_length, d, 0.1, rng),
            blocks,
            head_weight: xavier(d, shape.classes, rng),
            head_bias: Array1::zeros(shape.classes),
        }
    }

    pub fn zeros_like(&self) -> Self {
        let mut zeros = self.clone();
        for (_, p) in zeros.params_mut() {
            p.scale(0.0);
        }
        zeros
    }

    pub fn parameter_count(&self) -> usize {
        self.params()
            .iter()
            .map(|(_, p)| match p {
                ParamRef::Vector(v) => v.len(),
                ParamRef::Matrix(m) => m.len(),
            })
            .sum()
    }

    pub fn params(&self) -> Vec<(String, ParamRef<'_>)> {
        let mut out = vec![
            ("token_embedding".to_string(), ParamRef::Matrix(&self.token_embedding)),
            ("position_embedding".to_string(), ParamRef::Matrix(&self.position_embedding)),
        ];
        for (i, b) in self.blocks.iter().enumerate() {
            out.push((format!("blocks.{i}.wq"), ParamRef::Matrix(&b.wq)));
            out.push((format!("blocks.{i}.wk"), ParamRef::Matrix(&b.wk)));
            out.push((format!("blocks.{i}.wv"), ParamRef::Matrix(&b.wv)));
            out.push((format!("blocks.{i}.wo"), ParamRef::Matrix(&b.wo)));
            out.push((format!("blocks.{i}.w1"), ParamRef::Matrix(&b.w1)));
            out.push((format!("blocks.{i}.b1"), ParamRef::Vector(&b.b1)));
            out.push((format!("blocks.{i}.w2"), ParamRef::Matrix(&b.w2)));
            out.push((format!("blocks.{i}.b2"), ParamRef::Vector(&b.b2)));
        }
        out.push(("head_weight".to_string(), ParamRef::Matrix(&self.head_weight)));
        out.push(("head_bias".to_string(), ParamRef::Vector(&self.head_bias)));
        out
    }

    pub fn params_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        let mut out = vec![
            ("token_embedding".to_string(), ParamMut::Matrix(&mut self.token_embedding)),
            ("position_embedding".to_string(), ParamMut::Matrix(&mut self.position_embedding)),
        ];
        for (i, b) in self.blocks.iter_mut().enumerate() {
            out.push((format!("blocks.{i}.wq"), ParamMut::Matrix(&mut b.wq)));
            out.push((format!("blocks.{i}.wk"), ParamMut::Matrix(&mut b.wk)));
            out.push((format!("blocks.{i}.wv"), ParamMut::Matrix(&mut b.wv)));
            out.push((format!("blocks.{i}.wo"), ParamMut::Matrix(&mut b.wo)));
            out.push((format!("blocks.{i}.w1"), ParamMut::Matrix(&mut b.w1)));
            out.push((format!("blocks.{i}.b1"), ParamMut::Vector(&mut b.b1)));
            out.push((format!("blocks.{i}.w2"), ParamMut::Matrix(&mut b.w2)));
            out.push((format!("blocks.{i}.b2"), ParamMut::Vector(&mut b.b2)));
        }
        out.push(("head_weight".to_string(), ParamMut::Matrix(&mut self.head_weight)));
        out.push(("head_bias".to_string(), ParamMut::Vector(&mut self.head_bias)));
        out
    }

    pub fn scale(&mut self, factor: f32) {
        for (_, p) in self.params_mut() {
            p.scale(factor);
        }
    }

    /// One optimizer update per parameter, keyed by parameter path.
    pub fn apply(&mut self, grads: &EncoderParams, optimizer: &mut Optimizer, lr: f32) -> Result<(), EngineError> {
        for ((name, param), (_, grad)) in self.params_mut().into_iter().zip(grads.params()) {
            match (param, grad) {
                (ParamMut::Vector(p), ParamRef::Vector(g)) => optimizer.update(&name, p, g, lr)?,
                (ParamMut::Matrix(p), ParamRef::Matrix(g)) => optimizer.update(&name, p, g, lr)?,
                _ => {
                    return Err(EngineError::training(format!(
                        "gradient layout does not match parameter {name}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_named(&self) -> Vec<NamedTensor> {
        self.params()
            .into_iter()
            .map(|(name, p)| {
                let tensor = match p {
                    ParamRef::Vector(v) => TensorData {
                        shape: vec![v.len()],
                        data: v.to_vec(),
                    },
                    ParamRef::Matrix(m) => TensorData {
                        shape: m.shape().to_vec(),
                        data: m.iter().copied().collect(),
                    },
                };
                NamedTensor { name, tensor }
            })
            .collect()
    }

    /// Overwrite every parameter from `tensors`. Validates all before writing any.
    pub fn load_named(&mut self, tensors: &[NamedTensor]) -> Result<(), EngineError> {
        let find = |name: &str| {
            tensors
                .iter()
                .find(|t| t.name == name)
                .ok_or_else(|| EngineError::configuration(format!("checkpoint is missing parameter {name}")))
        };
        for (name, p) in self.params() {
            let expected = match p {
                ParamRef::Vector(v) => vec![v.len()],
                ParamRef::Matrix(m) => m.shape().to_vec(),
            };
            let t = find(&name)?;
            if t.tensor.shape != expected || t.tensor.data.len() != expected.iter().product::<usize>() {
                return Err(EngineError::configuration(format!(
                    "checkpoint parameter {name} has shape {:?}, expected {expected:?}",
                    t.tensor.shape
                )));
            }
        }
        for (name, p) in self.params_mut() {
            let t = find(&name)?;
            match p {
                ParamMut::Vector(v) => v.assign(&Array1::from_vec(t.tensor.data.clone())),
                ParamMut::Matrix(m) => {
                    let src = t.tensor.to_matrix()?;
                    m.assign(&src);
                }
            }
        }
        Ok(())
    }

    fn normalize_tokens(&self, ids: &[u32]) -> Vec<usize> {
        let vocab = self.shape.vocab_size;
        (0..self.shape.max_length)
            .map(|i| {
                let id = ids.get(i).copied().unwrap_or(PAD_TOKEN_ID) as usize;
                if id < vocab { id } else { UNK_TOKEN_ID as usize }
            })
            .collect()
    }

    /// Run the encoder. `dropout` is `(rate, rng)` in training mode.
    pub fn forward(&self, ids: &[u32], mut dropout: Option<(f32, &mut StdRng)>) -> ForwardCache {
        let d = self.shape.hidden;
        let tokens = self.normalize_tokens(ids);
        let mut key_mask: Vec<bool> = tokens.iter().map(|&t| t != PAD_TOKEN_ID as usize).collect();
        if !key_mask.iter().any(|&k| k) {
            key_mask.iter_mut().for_each(|k| *k = true);
        }
        let scale = 1.0 / (d as f32).sqrt();

        let mut x = Array2::from_shape_fn((tokens.len(), d), |(i, j)| {
            self.token_embedding[[tokens[i], j]] + self.position_embedding[[i, j]]
        });
        let mut caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let q = x.dot(&block.wq);
            let k = x.dot(&block.wk);
            let v = x.dot(&block.wv);
            let mut scores = q.dot(&k.t()) * scale;
            for (j, &keep) in key_mask.iter().enumerate() {
                if !keep {
                    scores.column_mut(j).fill(MASKED_SCORE);
                }
            }
            let attention = softmax_rows(&scores);
            let attended = attention.dot(&v);
            let (normed1, inv_std1) = layer_norm(&(&x + &attended.dot(&block.wo)));

            let pre_activation = normed1.dot(&block.w1) + &block.b1;
            let mut activated = pre_activation.mapv(|v| v.max(0.0));
            let dropout_mask = match dropout.as_mut() {
                Some((rate, rng)) if *rate > 0.0 => {
                    let keep = 1.0 / (1.0 - *rate);
                    let mask = Array2::from_shape_fn(activated.dim(), |_| {
                        if rng.r#gen::<f32>() < *rate { 0.0 } else { keep }
                    });
                    activated *= &mask;
                    Some(mask)
                }
                _ => None,
            };
            let (normed2, inv_std2) = layer_norm(&(&normed1 + &(activated.dot(&block.w2) + &block.b2)));

            caches.push(BlockCache {
                input: x,
                q,
                k,
                v,
                attention,
                attended,
                normed1,
                inv_std1,
                pre_activation,
                dropout_mask,
                activated,
                normed2: normed2.clone(),
                inv_std2,
            });
            x = normed2;
        }

        let pooled_rows: Vec<usize> = (0..tokens.len()).filter(|&i| key_mask[i]).collect();
        let mut pooled = Array1::<f32>::zeros(d);
        for &i in &pooled_rows {
            pooled += &x.row(i);
        }
        pooled /= pooled_rows.len().max(1) as f32;

        let logits = pooled.dot(&self.head_weight) + &self.head_bias;
        let probabilities = softmax_rows(&logits.insert_axis(Axis(0))).row(0).to_owned();

        ForwardCache {
            tokens,
            pooled_rows,
            blocks: caches,
            pooled,
            probabilities,
        }
    }

    /// Accumulate the cross-entropy gradient for `label` into `grads`.
    pub fn backward(&self, cache: &ForwardCache, label: usize, grads: &mut EncoderParams) {
        let d = self.shape.hidden;
        let scale = 1.0 / (d as f32).sqrt();

        let mut d_logits = cache.probabilities.clone();
        d_logits[label] -= 1.0;
        grads.head_weight += &cache
            .pooled
            .view()
            .insert_axis(Axis(1))
            .dot(&d_logits.view().insert_axis(Axis(0)));
        grads.head_bias += &d_logits;

        let d_pooled = self.head_weight.dot(&d_logits) / cache.pooled_rows.len().max(1) as f32;
        let mut dx = Array2::<f32>::zeros((cache.tokens.len(), d));
        for &i in &cache.pooled_rows {
            dx.row_mut(i).assign(&d_pooled);
        }

        for ((block, bc), g) in self
            .blocks
            .iter()
            .zip(&cache.blocks)
            .zip(grads.blocks.iter_mut())
            .rev()
        {
            // second sublayer: normed2 = LN(normed1 + act·w2 + b2)
            let dh2 = layer_norm_backward(&bc.normed2, &bc.inv_std2, &dx);
            g.w2 += &bc.activated.t().dot(&dh2);
            g.b2 += &dh2.sum_axis(Axis(0));
            let mut d_pre = dh2.dot(&block.w2.t());
            if let Some(mask) = &bc.dropout_mask {
                d_pre *= mask;
            }
            Zip::from(&mut d_pre)
                .and(&bc.pre_activation)
                .for_each(|dp, &p| {
                    if p <= 0.0 {
                        *dp = 0.0;
                    }
                });
            g.w1 += &bc.normed1.t().dot(&d_pre);
            g.b1 += &d_pre.sum_axis(Axis(0));
            let d_normed1 = &dh2 + &d_pre.dot(&block.w1.t());

            // first sublayer: normed1 = LN(x + softmax(q·kᵀ/√d)·v·wo)
            let dh1 = layer_norm_backward(&bc.normed1, &bc.inv_std1, &d_normed1);
            g.wo += &bc.attended.t().dot(&dh1);
            let d_attended = dh1.dot(&block.wo.t());
            let d_attention = d_attended.dot(&bc.v.t());
            let dv = bc.attention.t().dot(&d_attended);

            let mut d_scores = Array2::<f32>::zeros(bc.attention.dim());
            for i in 0..bc.attention.nrows() {
                let p = bc.attention.row(i);
                let dp = d_attention.row(i);
                let inner = p.dot(&dp);
                let mut out = d_scores.row_mut(i);
                Zip::from(&mut out)
                    .and(&p)
                    .and(&dp)
                    .for_each(|o, &pv, &dpv| *o = pv * (dpv - inner) * scale);
            }
            let dq = d_scores.dot(&bc.k);
            let dk = d_scores.t().dot(&bc.q);

            g.wq += &bc.input.t().dot(&dq);
            g.wk += &bc.input.t().dot(&dk);
            g.wv += &bc.input.t().dot(&dv);
            dx = dh1 + dq.dot(&block.wq.t()) + dk.dot(&block.wk.t()) + dv.dot(&block.wv.t());
        }

        for (i, &token) in cache.tokens.iter().enumerate() {
            let row = dx.row(i);
            let mut pos = grads.position_embedding.row_mut(i);
            pos += &row;
            let mut tok = grads.token_embedding.row_mut(token);
            tok += &row;
        }
    }
}
