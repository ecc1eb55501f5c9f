//! Adam moment accumulators and bias correction.
//!
//! Shape-agnostic: the tracker keeps whatever shape it is first given, which
//! for projected parameters is the low-rank shape.

use candle_core::{DType, Device, Tensor};
use galore_core::{GaloreError, Result};

/// Bias-correction factors for step `t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasCorrection {
    /// `1 - β1^t`
    pub first: f64,
    /// `1 - β2^t`
    pub second: f64,
}

impl BiasCorrection {
    pub fn at_step(beta1: f64, beta2: f64, step: usize) -> Self {
        let t = step.min(i32::MAX as usize) as i32;
        Self {
            first: 1.0 - beta1.powi(t),
            second: 1.0 - beta2.powi(t),
        }
    }

    /// `lr · √(1 - β2^t) / (1 - β1^t)`
    pub fn step_size(&self, lr: f64) -> f64 {
        lr * self.second.sqrt() / self.first
    }
}

/// Exponential moving averages of the gradient and its square.
#[derive(Debug, Clone)]
pub struct MomentTracker {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

impl MomentTracker {
    pub fn zeros(shape: (usize, usize), device: &Device) -> Result<Self> {
        Ok(Self {
            exp_avg: Tensor::zeros(shape, DType::F32, device)?,
            exp_avg_sq: Tensor::zeros(shape, DType::F32, device)?,
        })
    }

    pub fn zeros_like(t: &Tensor) -> Result<Self> {
        Ok(Self {
            exp_avg: Tensor::zeros(t.dims(), DType::F32, t.device())?,
            exp_avg_sq: Tensor::zeros(t.dims(), DType::F32, t.device())?,
        })
    }

    pub fn from_parts(exp_avg: Tensor, exp_avg_sq: Tensor) -> Result<Self> {
        if exp_avg.dims() != exp_avg_sq.dims() {
            return Err(GaloreError::ShapeMismatch {
                expected: exp_avg.dims().to_vec(),
                actual: exp_avg_sq.dims().to_vec(),
            });
        }
        Ok(Self { exp_avg, exp_avg_sq })
    }

    pub fn exp_avg(&self) -> &Tensor {
        &self.exp_avg
    }

    pub fn exp_avg_sq(&self) -> &Tensor {
        &self.exp_avg_sq
    }

    pub fn dims(&self) -> &[usize] {
        self.exp_avg.dims()
    }

    /// Accumulate `g` and return the next tracker plus the direction
    /// `m / (√v + ε)`.
    ///
    /// `self` is left untouched so a failed step never leaves half-updated
    /// moments behind.
    pub fn advance(&self, g: &Tensor, beta1: f64, beta2: f64, eps: f64) -> Result<(Self, Tensor)> {
        if g.dims() != self.exp_avg.dims() {
            return Err(GaloreError::ShapeMismatch {
                expected: self.exp_avg.dims().to_vec(),
                actual: g.dims().to_vec(),
            });
        }

        // m = β1·m + (1-β1)·g
        let m = ((&self.exp_avg * beta1)? + (g * (1.0 - beta1))?)?;
        // v = β2·v + (1-β2)·g²
        let v = ((&self.exp_avg_sq * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;

        let denom = (v.sqrt()? + eps)?;
        let direction = m.div(&denom)?;

        Ok((
            Self {
                exp_avg: m,
                exp_avg_sq: v,
            },
            direction,
        ))
    }
}
