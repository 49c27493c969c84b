//! Base model representation handed to adapters at initialization.

use crate::tensor::TensorData;
use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// A named weight tensor inside a layer.
#[derive(Debug, Clone)]
pub struct WeightTensor {
    pub name: String,
    pub value: ArrayD<f32>,
}

/// A named layer holding one or more weight tensors.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub weights: Vec<WeightTensor>,
}

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weights: Vec::new(),
        }
    }

    pub fn with_weight(mut self, name: impl Into<String>, value: ArrayD<f32>) -> Self {
        self.weights.push(WeightTensor {
            name: name.into(),
            value,
        });
        self
    }

    /// Whether the layer name contains any of the target substrings.
    pub fn matches_any(&self, targets: &[String]) -> bool {
        targets.iter().any(|t| self.name.contains(t.as_str()))
    }
}

/// The frozen model an adapter adapts.
#[derive(Debug, Clone, Default)]
pub struct BaseModel {
    pub name: String,
    pub layers: Vec<Layer>,
}

/// Shape description used to build synthetic base models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticLayerSpec {
    pub name: String,
    pub shapes: Vec<Vec<usize>>,
}

impl BaseModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
        }
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| l.weights.iter())
            .map(|w| w.value.len())
            .sum()
    }

    /// Build a model with uniformly random weights in `[-0.5, 0.5]`.
    pub fn synthetic(name: &str, specs: &[SyntheticLayerSpec], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = Self::new(name);
        for spec in specs {
            let mut layer = Layer::new(&spec.name);
            for (i, shape) in spec.shapes.iter().enumerate() {
                let value = ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-0.5..=0.5));
                let weight_name = if i == 0 { "weight".to_string() } else { format!("weight_{i}") };
                layer = layer.with_weight(weight_name, value);
            }
            model.layers.push(layer);
        }
        model
    }

    /// A small transformer-shaped model with attention and MLP projections.
    pub fn synthetic_transformer(hidden: usize, blocks: usize, seed: u64) -> Self {
        let mut specs = Vec::new();
        for b in 0..blocks {
            for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                specs.push(SyntheticLayerSpec {
                    name: format!("layers.{b}.attn.{proj}"),
                    shapes: vec![vec![hidden, hidden]],
                });
            }
            specs.push(SyntheticLayerSpec {
                name: format!("layers.{b}.mlp.up_proj"),
                shapes: vec![vec![hidden * 2, hidden], vec![hidden * 2]],
            });
        }
        Self::synthetic("synthetic-transformer", &specs, seed)
    }

    /// Serializable snapshot of all weights.
    pub fn export(&self) -> Vec<(String, TensorData)> {
        self.layers
            .iter()
            .flat_map(|l| {
                l.weights
                    .iter()
                    .map(move |w| (format!("{}.{}", l.name, w.name), TensorData::from_array(&w.value)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_matching() {
        let layer = Layer::new("layers.0.attn.q_proj");
        assert!(layer.matches_any(&["q_proj".into()]));
        assert!(!layer.matches_any(&["mlp".into()]));
        assert!(!layer.matches_any(&[]));
    }

    #[test]
    fn test_synthetic_transformer_shapes() {
        let model = BaseModel::synthetic_transformer(8, 2, 1);
        assert_eq!(model.layers.len(), 10);
        let up = model.layer("layers.1.mlp.up_proj").unwrap();
        assert_eq!(up.weights[0].value.shape(), &[16, 8]);
        assert_eq!(up.weights[1].value.shape(), &[16]);
        assert_eq!(model.parameter_count(), 2 * (4 * 64 + 128 + 16));
        assert_eq!(model.export().len(), 12);
    }

    #[test]
    fn test_synthetic_is_seeded() {
        let a = BaseModel::synthetic_transformer(4, 1, 9);
        let b = BaseModel::synthetic_transformer(4, 1, 9);
        assert_eq!(a.layers[0].weights[0].value, b.layers[0].weights[0].value);
    }
}
