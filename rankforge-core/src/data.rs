//! Pre-tokenized training data and minibatching.
//!
//! The data layer supplies `{inputs, labels}` already tokenized and split
//! into train/validation. The engine does not care where they came from.

use crate::error::EngineError;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Padding token id shared by every tokenizer in the engine.
pub const PAD_TOKEN_ID: u32 = 0;

/// A labelled set of token sequences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub inputs: Vec<Vec<u32>>,
    pub labels: Vec<usize>,
    pub num_classes: usize,
}

impl Dataset {
    pub fn new(inputs: Vec<Vec<u32>>, labels: Vec<usize>, num_classes: usize) -> Result<Self, EngineError> {
        let dataset = Self {
            inputs,
            labels,
            num_classes,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.inputs.len() != self.labels.len() {
            return Err(EngineError::configuration(format!(
                "dataset has {} inputs but {} labels",
                self.inputs.len(),
                self.labels.len()
            )));
        }
        if self.num_classes == 0 {
            return Err(EngineError::configuration("dataset must declare at least one class"));
        }
        if let Some(label) = self.labels.iter().find(|&&l| l >= self.num_classes) {
            return Err(EngineError::configuration(format!(
                "label {label} out of range for {} classes",
                self.num_classes
            )));
        }
        Ok(())
    }

    /// Number of minibatches for a batch size (last batch may be short).
    pub fn batch_count(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            return 0;
        }
        self.len().div_ceil(batch_size)
    }

    /// Iterate over consecutive minibatches.
    pub fn minibatches(&self, batch_size: usize) -> impl Iterator<Item = Batch<'_>> {
        let size = batch_size.max(1);
        self.inputs
            .chunks(size)
            .zip(self.labels.chunks(size))
            .map(|(inputs, labels)| Batch {
                inputs,
                labels,
                num_classes: self.num_classes,
            })
    }

    /// Synthetic corpus whose label is recoverable from the dominant token band.
    pub fn synthetic(samples: usize, seq_len: usize, vocab_size: u32, num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let classes = num_classes.max(1);
        let band = (vocab_size.saturating_sub(5) / classes as u32).max(1);
        let mut inputs = Vec::with_capacity(samples);
        let mut labels = Vec::with_capacity(samples);
        for _ in 0..samples {
            let label = rng.gen_range(0..classes);
            let start = 5 + band * label as u32;
            let seq: Vec<u32> = (0..seq_len)
                .map(|_| {
                    if rng.gen_bool(0.8) {
                        start + rng.gen_range(0..band)
                    } else {
                        rng.gen_range(5..vocab_size.max(6))
                    }
                })
                .collect();
            inputs.push(seq);
            labels.push(label);
        }
        Self {
            inputs,
            labels,
            num_classes: classes,
        }
    }
}

/// Train/validation split supplied to a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingData {
    pub train: Dataset,
    #[serde(default)]
    pub validation: Option<Dataset>,
}

impl TrainingData {
    pub fn new(train: Dataset, validation: Option<Dataset>) -> Self {
        Self { train, validation }
    }
}

/// A borrowed minibatch.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub inputs: &'a [Vec<u32>],
    pub labels: &'a [usize],
    pub num_classes: usize,
}

impl Batch<'_> {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Normalized bag-of-tokens histogram hashed into `width` buckets.
///
/// Padding tokens are ignored; a sequence of only padding maps to zeros.
pub fn hashed_features(tokens: &[u32], width: usize) -> Array1<f32> {
    let mut features = Array1::<f32>::zeros(width.max(1));
    let mut count = 0usize;
    for &t in tokens.iter().filter(|&&t| t != PAD_TOKEN_ID) {
        features[t as usize % width.max(1)] += 1.0;
        count += 1;
    }
    if count > 0 {
        features /= count as f32;
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minibatches_cover_dataset() {
        let data = Dataset::synthetic(70, 6, 50, 3, 1);
        assert_eq!(data.batch_count(32), 3);
        let sizes: Vec<usize> = data.minibatches(32).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![32, 32, 6]);
        assert!(data.minibatches(32).all(|b| b.num_classes == 3));
    }

    #[test]
    fn test_validate_rejects_mismatch() {
        let err = Dataset::new(vec![vec![1, 2]], vec![], 2).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        let err = Dataset::new(vec![vec![1]], vec![5], 2).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_hashed_features_ignore_padding() {
        let f = hashed_features(&[3, 7, 0, 0], 4);
        assert_eq!(f.len(), 4);
        assert!((f[3] - 1.0).abs() < 1e-6);
        let empty = hashed_features(&[0, 0], 4);
        assert!(empty.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_synthetic_labels_in_range() {
        let data = Dataset::synthetic(40, 8, 30, 4, 2);
        assert!(data.validate().is_ok());
        assert!(data.inputs.iter().all(|s| s.len() == 8 && s.iter().all(|&t| t >= 5 && t < 30)));
    }
}
