//! Low-rank factorization strategies.
//!
//! Neither default computes a true SVD/QR. [`RandomLowRank`] draws both
//! factors at random; [`RefinedLowRank`] starts from random factors and runs a
//! few gradient-descent iterations on the reconstruction residual. Adapters
//! only depend on [`DecompositionStrategy`], so an exact factorization can be
//! dropped in later.

use crate::tensor::{frobenius_norm, random_matrix};
use ndarray::Array2;
use rand::rngs::StdRng;

/// A pair of factors whose product approximates an `m x n` matrix.
#[derive(Debug, Clone)]
pub struct LowRankFactors {
    /// `m x r`
    pub left: Array2<f32>,
    /// `r x n`
    pub right: Array2<f32>,
}

impl LowRankFactors {
    pub fn rank(&self) -> usize {
        self.left.ncols()
    }

    pub fn product(&self) -> Array2<f32> {
        self.left.dot(&self.right)
    }

    pub fn element_count(&self) -> usize {
        self.left.len() + self.right.len()
    }
}

/// Factorizes a matrix at a requested rank.
pub trait DecompositionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn factorize(&self, matrix: &Array2<f32>, rank: usize, rng: &mut StdRng) -> LowRankFactors;
}

/// Random factors, independent of the matrix content.
#[derive(Debug, Clone)]
pub struct RandomLowRank {
    pub scale: f32,
}

impl RandomLowRank {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }
}

impl DecompositionStrategy for RandomLowRank {
    fn name(&self) -> &'static str {
        "random_low_rank"
    }

    fn factorize(&self, matrix: &Array2<f32>, rank: usize, rng: &mut StdRng) -> LowRankFactors {
        let (m, n) = matrix.dim();
        LowRankFactors {
            left: random_matrix(m, rank, self.scale, rng),
            right: random_matrix(rank, n, self.scale, rng),
        }
    }
}

/// Random factors refined by gradient descent on `matrix - left·right`.
#[derive(Debug, Clone)]
pub struct RefinedLowRank {
    pub scale: f32,
    pub iterations: usize,
    pub learning_rate: f32,
}

impl RefinedLowRank {
    pub fn new(scale: f32, iterations: usize, learning_rate: f32) -> Self {
        Self {
            scale,
            iterations,
            learning_rate,
        }
    }
}

impl DecompositionStrategy for RefinedLowRank {
    fn name(&self) -> &'static str {
        "refined_low_rank"
    }

    fn factorize(&self, matrix: &Array2<f32>, rank: usize, rng: &mut StdRng) -> LowRankFactors {
        let mut factors = RandomLowRank::new(self.scale).factorize(matrix, rank, rng);
        for _ in 0..self.iterations {
            let residual = matrix - &factors.product();
            let grad_left = residual.dot(&factors.right.t());
            let grad_right = factors.left.t().dot(&residual);

            let left_sq = factors.left.iter().map(|v| v * v).sum::<f32>();
            let right_sq = factors.right.iter().map(|v| v * v).sum::<f32>();
            let step = self.learning_rate / (1.0 + left_sq.max(right_sq));

            let next_left = &factors.left + &(grad_left * step);
            let next_right = &factors.right + &(grad_right * step);
            if next_left.iter().chain(next_right.iter()).any(|v| !v.is_finite()) {
                break;
            }
            factors.left = next_left;
            factors.right = next_right;
        }
        factors
    }
}

/// `‖matrix - product‖ / ‖matrix‖`, or the absolute error for a zero matrix.
pub fn relative_error(matrix: &Array2<f32>, factors: &LowRankFactors) -> f32 {
    let residual = matrix - &factors.product();
    let err = frobenius_norm(residual.iter());
    let base = frobenius_norm(matrix.iter());
    if base > 0.0 { err / base } else { err }
}

/// Strategies for exercising the factorization seam in tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ndarray::s;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// The matrix's leading `rank` columns times a column selector. Exact
    /// when `rank` equals the column count.
    #[derive(Debug, Clone, Default)]
    pub struct ColumnPrefix {
        pub calls: Arc<AtomicUsize>,
    }

    impl ColumnPrefix {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DecompositionStrategy for ColumnPrefix {
        fn name(&self) -> &'static str {
            "column_prefix"
        }

        fn factorize(&self, matrix: &Array2<f32>, rank: usize, _rng: &mut StdRng) -> LowRankFactors {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = matrix.ncols();
            LowRankFactors {
                left: matrix.slice(s![.., ..rank]).to_owned(),
                right: Array2::from_shape_fn((rank, n), |(i, j)| if i == j { 1.0 } else { 0.0 }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_random_factor_shapes() {
        let mut rng = StdRng::seed_from_u64(7);
        let matrix = Array2::<f32>::zeros((12, 5));
        let factors = RandomLowRank::new(0.01).factorize(&matrix, 3, &mut rng);
        assert_eq!(factors.left.dim(), (12, 3));
        assert_eq!(factors.right.dim(), (3, 5));
        assert_eq!(factors.product().dim(), (12, 5));
        assert_eq!(factors.element_count(), 36 + 15);
        assert!(factors.left.iter().all(|v| v.abs() <= 0.01));
    }

    #[test]
    fn test_refinement_reduces_residual() {
        let mut rng = StdRng::seed_from_u64(11);
        let matrix = Array2::from_shape_fn((8, 8), |(i, j)| ((i + j) % 3) as f32 * 0.5);
        let base = RandomLowRank::new(0.1).factorize(&matrix, 4, &mut StdRng::seed_from_u64(11));
        let refined = RefinedLowRank::new(0.1, 200, 0.05).factorize(&matrix, 4, &mut rng);
        assert!(relative_error(&matrix, &refined) < relative_error(&matrix, &base));
    }

    #[test]
    fn test_relative_error_zero_matrix() {
        let matrix = Array2::<f32>::zeros((2, 2));
        let factors = LowRankFactors {
            left: Array2::zeros((2, 1)),
            right: Array2::zeros((1, 2)),
        };
        assert_eq!(relative_error(&matrix, &factors), 0.0);
    }
}
