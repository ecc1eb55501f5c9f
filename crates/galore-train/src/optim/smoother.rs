//! EMA smoothing of dual-basis subspaces.
//!
//! `blended = old * decay + new * (1 - decay)`, elementwise. The blend of two
//! orthonormal bases is generally not orthonormal and is not re-orthonormalized.

use candle_core::Tensor;
use galore_core::{GaloreError, Result};

use super::projector::ProjectionBasis;

/// Elementwise EMA of two same-shaped tensors.
pub fn smooth(old: &Tensor, new: &Tensor, decay: f64) -> Result<Tensor> {
    if old.dims() != new.dims() {
        return Err(GaloreError::ShapeMismatch {
            expected: old.dims().to_vec(),
            actual: new.dims().to_vec(),
        });
    }
    let kept = (old * decay)?;
    let fresh = (new * (1.0 - decay))?;
    Ok((&kept + &fresh)?)
}

/// Blend a fresh dual basis into the stored one, left and right independently.
pub fn smooth_basis(
    old: &ProjectionBasis,
    new: ProjectionBasis,
    decay: f64,
) -> Result<ProjectionBasis> {
    match (old, new) {
        (
            ProjectionBasis::Dual { left: old_left, right: old_right },
            ProjectionBasis::Dual { left, right },
        ) => Ok(ProjectionBasis::Dual {
            left: smooth(old_left, &left, decay)?,
            right: smooth(old_right, &right, decay)?,
        }),
        // Single bases are always overwritten.
        (_, new) => Ok(new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_smooth_formula_exact() -> Result<()> {
        let dev = Device::Cpu;
        let old = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [0.0, 0.0]], &dev)?;
        let new = Tensor::new(&[[0.0f32, 1.0], [1.0, 0.0], [0.0, 0.0]], &dev)?;
        let out = smooth(&old, &new, 0.75)?.to_vec2::<f32>()?;
        assert_eq!(out, vec![vec![0.75, 0.25], vec![0.25, 0.75], vec![0.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn test_smooth_endpoints() -> Result<()> {
        let dev = Device::Cpu;
        let old = Tensor::randn(0.0f32, 1.0, (4, 2), &dev)?;
        let new = Tensor::randn(0.0f32, 1.0, (4, 2), &dev)?;
        let keep = smooth(&old, &new, 1.0)?;
        let replace = smooth(&old, &new, 0.0)?;
        assert_eq!(keep.to_vec2::<f32>()?, old.to_vec2::<f32>()?);
        assert_eq!(replace.to_vec2::<f32>()?, new.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_blend_is_not_orthonormal() -> Result<()> {
        let dev = Device::Cpu;
        let old = Tensor::new(&[[1.0f32], [0.0]], &dev)?;
        let new = Tensor::new(&[[0.0f32], [1.0]], &dev)?;
        let blended = smooth(&old, &new, 0.5)?;
        let norm_sq = blended.sqr()?.sum_all()?.to_scalar::<f32>()?;
        assert!((norm_sq - 0.5).abs() < 1e-6, "column norm² should be 0.5, got {}", norm_sq);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_rejected() -> Result<()> {
        let dev = Device::Cpu;
        let old = Tensor::zeros((4, 2), DType::F32, &dev)?;
        let new = Tensor::zeros((4, 3), DType::F32, &dev)?;
        assert!(matches!(
            smooth(&old, &new, 0.5),
            Err(GaloreError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
