//! Linear-probe objective shared by the weight-reconstructing adapters.
//!
//! Each adapted weight (viewed as an `m x n` matrix) is scored by applying it
//! to a hashed bag-of-tokens feature vector of width `n` and reading the
//! first `k = min(m, classes)` outputs as class logits. Labels fold into
//! `0..k` so narrow weights still produce a well-defined loss.

use crate::data::{Batch, hashed_features};
use ndarray::{Array2, s};

/// Loss, accuracy and gradient of the probe for one batch.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub loss: f32,
    pub accuracy: f32,
    /// Gradient of the mean loss with respect to the matrix. Same shape.
    pub grad: Array2<f32>,
}

/// Score `matrix` on `batch`. Returns zeros for an empty batch.
pub fn probe(matrix: &Array2<f32>, batch: Batch<'_>) -> ProbeResult {
    let (m, n) = matrix.dim();
    let k = m.min(batch.num_classes.max(1));
    let mut grad = Array2::<f32>::zeros((m, n));
    if batch.is_empty() || k == 0 {
        return ProbeResult {
            loss: 0.0,
            accuracy: 0.0,
            grad,
        };
    }

    let head = matrix.slice(s![..k, ..]);
    let mut loss = 0.0_f32;
    let mut correct = 0usize;
    for (tokens, &label) in batch.inputs.iter().zip(batch.labels) {
        let x = hashed_features(tokens, n);
        let logits = head.dot(&x);
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp = logits.mapv(|v| (v - max).exp());
        let probs = &exp / exp.sum();

        let target = label % k;
        loss -= probs[target].max(1e-12).ln();
        let predicted = probs
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
            .0;
        if predicted == target {
            correct += 1;
        }

        for i in 0..k {
            let delta = probs[i] - if i == target { 1.0 } else { 0.0 };
            let mut row = grad.row_mut(i);
            row.scaled_add(delta, &x);
        }
    }

    let count = batch.len() as f32;
    grad /= count;
    ProbeResult {
        loss: loss / count,
        accuracy: correct as f32 / count,
        grad,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn batch<'a>(inputs: &'a [Vec<u32>], labels: &'a [usize], classes: usize) -> Batch<'a> {
        Batch {
            inputs,
            labels,
            num_classes: classes,
        }
    }

    #[test]
    fn test_uniform_logits_give_log_k_loss() {
        let matrix = Array2::<f32>::zeros((4, 6));
        let inputs = vec![vec![1, 2, 3]];
        let labels = vec![1];
        let result = probe(&matrix, batch(&inputs, &labels, 3));
        assert!((result.loss - 3.0_f32.ln()).abs() < 1e-5);
        // rows beyond the class count get no gradient
        assert!(result.grad.row(3).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let matrix = array![[0.2_f32, -0.1, 0.3], [0.0, 0.4, -0.2]];
        let inputs = vec![vec![1, 2, 2], vec![4, 5]];
        let labels = vec![0, 1];
        let result = probe(&matrix, batch(&inputs, &labels, 2));

        let eps = 1e-3;
        for i in 0..2 {
            for j in 0..3 {
                let mut plus = matrix.clone();
                plus[[i, j]] += eps;
                let mut minus = matrix.clone();
                minus[[i, j]] -= eps;
                let numeric = (probe(&plus, batch(&inputs, &labels, 2)).loss
                    - probe(&minus, batch(&inputs, &labels, 2)).loss)
                    / (2.0 * eps);
                assert!((numeric - result.grad[[i, j]]).abs() < 1e-3, "({i},{j})");
            }
        }
    }

    #[test]
    fn test_single_row_matrix_is_trivially_correct() {
        let matrix = Array2::<f32>::ones((1, 5));
        let inputs = vec![vec![3]];
        let labels = vec![2];
        let result = probe(&matrix, batch(&inputs, &labels, 4));
        assert_eq!(result.loss, 0.0);
        assert_eq!(result.accuracy, 1.0);
    }
}
