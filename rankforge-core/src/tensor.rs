//! Tensor helpers and buffer lifecycle accounting.
//!
//! Adapters keep their long-lived parameters in [`TrackedBuffer`]s so that
//! live allocations can be observed (memory metrics) and bounded (resource
//! ceiling). Dropping a buffer releases its accounting; rank changes drop the
//! old buffer before the replacement is allocated.

use crate::error::EngineError;
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Serializable tensor snapshot used in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn from_array(array: &ArrayD<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>, EngineError> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|e| {
            EngineError::configuration(format!(
                "tensor data does not match shape {:?}: {e}",
                self.shape
            ))
        })
    }

    pub fn to_matrix(&self) -> Result<Array2<f32>, EngineError> {
        as_matrix(self.to_array()?)
    }
}

/// Counts live tracked buffers and their bytes.
#[derive(Debug, Clone, Default)]
pub struct BufferTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    limit: Option<usize>,
}

impl BufferTracker {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                limit,
                ..Default::default()
            }),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.inner.live_buffers.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> usize {
        self.inner.live_bytes.load(Ordering::SeqCst)
    }

    pub fn peak_bytes(&self) -> usize {
        self.inner.peak_bytes.load(Ordering::SeqCst)
    }

    /// Account for `bytes` of adapter-owned memory, enforcing the ceiling.
    pub fn reserve(&self, bytes: usize) -> Result<Reservation, EngineError> {
        let previous = self.inner.live_bytes.fetch_add(bytes, Ordering::SeqCst);
        let total = previous + bytes;
        if let Some(limit) = self.inner.limit {
            if total > limit {
                self.inner.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
                return Err(EngineError::resource(format!(
                    "allocating {bytes} bytes would exceed buffer ceiling of {limit} bytes ({previous} live)"
                )));
            }
        }
        self.inner.live_buffers.fetch_add(1, Ordering::SeqCst);
        self.inner.peak_bytes.fetch_max(total, Ordering::SeqCst);
        Ok(Reservation {
            bytes,
            tracker: self.clone(),
        })
    }

    /// Wrap an array in a tracked buffer.
    pub fn track(&self, array: ArrayD<f32>) -> Result<TrackedBuffer, EngineError> {
        let reservation = self.reserve(array.len() * std::mem::size_of::<f32>())?;
        Ok(TrackedBuffer { array, reservation })
    }

    /// Track a matrix.
    pub fn track_matrix(&self, matrix: Array2<f32>) -> Result<TrackedBuffer, EngineError> {
        self.track(matrix.into_dyn())
    }

    fn release(&self, bytes: usize) {
        self.inner.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
        self.inner.live_buffers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accounting handle for a block of live memory. Released on drop.
#[derive(Debug)]
pub struct Reservation {
    bytes: usize,
    tracker: BufferTracker,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

/// A long-lived adapter buffer whose allocation is accounted for.
#[derive(Debug)]
pub struct TrackedBuffer {
    array: ArrayD<f32>,
    reservation: Reservation,
}

impl TrackedBuffer {
    pub fn view(&self) -> &ArrayD<f32> {
        &self.array
    }

    pub fn view_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.array
    }

    pub fn shape(&self) -> &[usize] {
        self.array.shape()
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.reservation.bytes()
    }

    /// Copy out as a 2-D matrix. Fails if the buffer is not 2-D.
    pub fn matrix(&self) -> Result<Array2<f32>, EngineError> {
        as_matrix(self.array.clone())
    }

    /// Release the accounting and hand back the raw array.
    pub fn into_inner(self) -> ArrayD<f32> {
        let Self { array, reservation } = self;
        drop(reservation);
        array
    }
}

/// Convert a dynamic-rank array into a matrix.
pub fn as_matrix(array: ArrayD<f32>) -> Result<Array2<f32>, EngineError> {
    let shape = array.shape().to_vec();
    array
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|_| EngineError::configuration(format!("expected a 2-D tensor, got {shape:?}")))
}

/// The 2-D shape a tensor is viewed as for factorization.
///
/// 2-D tensors keep their shape, 4-D kernels become `out x (in*kh*kw)`,
/// everything else becomes `rows x last_dim`.
pub fn matrix_shape(shape: &[usize]) -> (usize, usize) {
    match shape.len() {
        0 => (1, 1),
        1 => (1, shape[0]),
        2 => (shape[0], shape[1]),
        4 => (shape[0], shape[1] * shape[2] * shape[3]),
        _ => {
            let last = shape[shape.len() - 1];
            (shape[..shape.len() - 1].iter().product(), last)
        }
    }
}

/// Reshape any tensor into its factorization matrix view.
pub fn to_matrix_view(array: &ArrayD<f32>) -> Result<Array2<f32>, EngineError> {
    let (rows, cols) = matrix_shape(array.shape());
    let data: Vec<f32> = array.iter().copied().collect();
    Array2::from_shape_vec((rows, cols), data)
        .map_err(|e| EngineError::configuration(format!("cannot view tensor as matrix: {e}")))
}

/// Reshape a matrix back into an arbitrary target shape with the same element count.
pub fn from_matrix_view(matrix: Array2<f32>, shape: &[usize]) -> Result<ArrayD<f32>, EngineError> {
    let expected: usize = shape.iter().product();
    if matrix.len() != expected {
        return Err(EngineError::configuration(format!(
            "cannot reshape {} elements into {shape:?}",
            matrix.len()
        )));
    }
    let data: Vec<f32> = matrix.iter().copied().collect();
    ArrayD::from_shape_vec(IxDyn(shape), data)
        .map_err(|e| EngineError::configuration(format!("reshape failed: {e}")))
}

pub fn frobenius_norm<'a, I>(values: I) -> f32
where
    I: IntoIterator<Item = &'a f32>,
{
    values.into_iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Per-row L2 norms of a matrix, as a column vector.
pub fn row_norms(matrix: &Array2<f32>) -> Array2<f32> {
    let norms: Vec<f32> = matrix
        .axis_iter(Axis(0))
        .map(|row| frobenius_norm(row.iter()))
        .collect();
    Array2::from_shape_fn((norms.len(), 1), |(i, _)| norms[i])
}

/// Matrix with entries drawn uniformly from `[-scale, scale]`.
pub fn random_matrix<R: Rng>(rows: usize, cols: usize, scale: f32, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_simple_fn((rows, cols), || rng.gen_range(-scale..=scale))
}

/// Row-wise numerically stable softmax.
pub fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum: f32 = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}
