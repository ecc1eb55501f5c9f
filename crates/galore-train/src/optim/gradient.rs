//! Gradient inputs accepted by the optimizer.

use candle_core::Tensor;

/// Coordinate-format sparse gradient.
///
/// Only carried so the optimizer can reject it: low-rank projection is
/// defined for dense tensors.
#[derive(Debug, Clone)]
pub struct SparseGradient {
    pub shape: Vec<usize>,
    /// Flat (row-major) offsets of the stored entries.
    pub indices: Vec<usize>,
    pub values: Vec<f32>,
}

impl SparseGradient {
    pub fn new(shape: Vec<usize>, indices: Vec<usize>, values: Vec<f32>) -> Self {
        Self {
            shape,
            indices,
            values,
        }
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }
}

/// A gradient handed to [`super::GaLore::step_with_grads`].
#[derive(Debug, Clone)]
pub enum Gradient {
    Dense(Tensor),
    Sparse(SparseGradient),
}

impl Gradient {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            Gradient::Dense(t) => t.dims(),
            Gradient::Sparse(s) => &s.shape,
        }
    }
}

impl From<Tensor> for Gradient {
    fn from(t: Tensor) -> Self {
        Gradient::Dense(t)
    }
}

impl From<SparseGradient> for Gradient {
    fn from(s: SparseGradient) -> Self {
        Gradient::Sparse(s)
    }
}
