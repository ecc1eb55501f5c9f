//! Per-parameter optimizer state and its serializable snapshot.

use candle_core::{Device, Tensor};
use galore_core::{GaLoreConfig, GaloreError, ProjectionKind, Result};
use serde::{Deserialize, Serialize};

use super::moments::MomentTracker;
use super::projector::{ProjectionBasis, ProjectionSide};

/// Flat tensor snapshot used by optimizer state export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorState {
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: t.dims().to_vec(),
            data: t.to_dtype(candle_core::DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let expected_len: usize = self.shape.iter().product();
        if self.data.len() != expected_len {
            return Err(GaloreError::StateMismatch(format!(
                "tensor data length mismatch: shape {:?} needs {}, got {}",
                self.shape,
                expected_len,
                self.data.len()
            )));
        }
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

/// How a parameter's update is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Moments live in the projected space.
    Projected,
    /// Plain Adam on the full shape (vectors, scalars, small matrices).
    Dense,
}

/// Optimizer state owned by one parameter.
///
/// Fields are only readable from outside the optimizer; every mutation goes
/// through the update engine.
#[derive(Debug, Clone)]
pub struct ParamState {
    pub(crate) step: usize,
    pub(crate) mode: UpdateMode,
    pub(crate) moments: MomentTracker,
    pub(crate) basis: Option<ProjectionBasis>,
    pub(crate) last_refresh: Option<usize>,
    pub(crate) refreshes: usize,
}

impl ParamState {
    /// Fresh state for a parameter whose gradient has 2-D shape `(rows, cols)`.
    ///
    /// Moments are allocated at the projected shape the first basis will have.
    pub(crate) fn projected(
        rows: usize,
        cols: usize,
        config: &GaLoreConfig,
        device: &Device,
    ) -> Result<Self> {
        let r = config.rank.min(rows).min(cols);
        let shape = match config.projection {
            ProjectionKind::Single => match ProjectionSide::for_shape(rows, cols) {
                ProjectionSide::Left => (r, cols),
                ProjectionSide::Right => (rows, r),
            },
            ProjectionKind::Dual => (r, r),
        };
        Ok(Self {
            step: 0,
            mode: UpdateMode::Projected,
            moments: MomentTracker::zeros(shape, device)?,
            basis: None,
            last_refresh: None,
            refreshes: 0,
        })
    }

    pub(crate) fn dense(param: &Tensor) -> Result<Self> {
        Ok(Self {
            step: 0,
            mode: UpdateMode::Dense,
            moments: MomentTracker::zeros_like(param)?,
            basis: None,
            last_refresh: None,
            refreshes: 0,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn exp_avg(&self) -> &Tensor {
        self.moments.exp_avg()
    }

    pub fn exp_avg_sq(&self) -> &Tensor {
        self.moments.exp_avg_sq()
    }

    pub fn basis(&self) -> Option<&ProjectionBasis> {
        self.basis.as_ref()
    }

    /// Step at which the basis was last recomputed.
    pub fn last_refresh(&self) -> Option<usize> {
        self.last_refresh
    }

    /// Number of basis recomputations so far.
    pub fn refreshes(&self) -> usize {
        self.refreshes
    }

    pub fn export(&self) -> Result<ParamStateSnapshot> {
        let basis = match &self.basis {
            None => None,
            Some(ProjectionBasis::Single { basis, side }) => Some(BasisState::Single {
                basis: TensorState::from_tensor(basis)?,
                side: *side,
            }),
            Some(ProjectionBasis::Dual { left, right }) => Some(BasisState::Dual {
                left: TensorState::from_tensor(left)?,
                right: TensorState::from_tensor(right)?,
            }),
        };
        Ok(ParamStateSnapshot {
            step: self.step,
            mode: self.mode,
            exp_avg: TensorState::from_tensor(self.moments.exp_avg())?,
            exp_avg_sq: TensorState::from_tensor(self.moments.exp_avg_sq())?,
            basis,
            last_refresh: self.last_refresh,
            refreshes: self.refreshes,
        })
    }

    /// Rebuild a state, checking it against a freshly initialized template.
    ///
    /// `matrix_shape` is the 2-D view of the parameter.
    pub(crate) fn restore(
        snap: &ParamStateSnapshot,
        template: &ParamState,
        kind: ProjectionKind,
        matrix_shape: (usize, usize),
        device: &Device,
    ) -> Result<Self> {
        if snap.mode != template.mode {
            return Err(GaloreError::StateMismatch(format!(
                "update mode mismatch: expected {:?}, got {:?}",
                template.mode, snap.mode
            )));
        }
        if snap.exp_avg.shape != template.moments.dims()
            || snap.exp_avg_sq.shape != template.moments.dims()
        {
            return Err(GaloreError::StateMismatch(format!(
                "moment shape mismatch: expected {:?}, got {:?} / {:?}",
                template.moments.dims(),
                snap.exp_avg.shape,
                snap.exp_avg_sq.shape
            )));
        }
        let moments = MomentTracker::from_parts(
            snap.exp_avg.to_tensor(device)?,
            snap.exp_avg_sq.to_tensor(device)?,
        )?;

        let basis = match (&snap.basis, snap.mode) {
            (None, _) => None,
            (Some(_), UpdateMode::Dense) => {
                return Err(GaloreError::StateMismatch(
                    "dense parameter cannot carry a projection basis".into(),
                ))
            }
            (Some(BasisState::Single { basis, side }), UpdateMode::Projected) => {
                if kind != ProjectionKind::Single {
                    return Err(GaloreError::StateMismatch(
                        "single basis restored into a dual-basis optimizer".into(),
                    ));
                }
                Some(ProjectionBasis::Single {
                    basis: basis.to_tensor(device)?,
                    side: *side,
                })
            }
            (Some(BasisState::Dual { left, right }), UpdateMode::Projected) => {
                if kind != ProjectionKind::Dual {
                    return Err(GaloreError::StateMismatch(
                        "dual basis restored into a single-basis optimizer".into(),
                    ));
                }
                Some(ProjectionBasis::Dual {
                    left: left.to_tensor(device)?,
                    right: right.to_tensor(device)?,
                })
            }
        };

        if let Some(b) = &basis {
            let (rows, cols) = matrix_shape;
            check_basis_shape(b, rows, cols)?;
            let projected = b.projected_shape(rows, cols)?;
            if [projected.0, projected.1] != template.moments.dims() {
                return Err(GaloreError::StateMismatch(format!(
                    "basis projects {}x{} to {:?}, moments are {:?}",
                    rows,
                    cols,
                    projected,
                    template.moments.dims()
                )));
            }
        }

        Ok(Self {
            step: snap.step,
            mode: snap.mode,
            moments,
            basis,
            last_refresh: snap.last_refresh,
            refreshes: snap.refreshes,
        })
    }
}

/// A basis must have the orientation and row count of a `(rows, cols)` parameter.
fn check_basis_shape(basis: &ProjectionBasis, rows: usize, cols: usize) -> Result<()> {
    match basis {
        ProjectionBasis::Single { basis, side } => {
            let expected_side = ProjectionSide::for_shape(rows, cols);
            if *side != expected_side {
                return Err(GaloreError::StateMismatch(format!(
                    "basis side {:?} does not fit a {}x{} parameter (expected {:?})",
                    side, rows, cols, expected_side
                )));
            }
            let (n, r) = basis.dims2()?;
            let expected_rows = match side {
                ProjectionSide::Left => rows,
                ProjectionSide::Right => cols,
            };
            if n != expected_rows {
                return Err(GaloreError::StateMismatch(format!(
                    "basis is {}x{}, expected {}x{} for a {}x{} parameter",
                    n, r, expected_rows, r, rows, cols
                )));
            }
        }
        ProjectionBasis::Dual { left, right } => {
            let (lm, lr) = left.dims2()?;
            let (rn, rr) = right.dims2()?;
            if lm != rows || rn != cols || lr != rr {
                return Err(GaloreError::StateMismatch(format!(
                    "dual bases are {}x{} and {}x{}, expected {}xr and {}xr for a {}x{} parameter",
                    lm, lr, rn, rr, rows, cols, rows, cols
                )));
            }
        }
    }
    Ok(())
}

/// Serialized projection basis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BasisState {
    Single {
        basis: TensorState,
        side: ProjectionSide,
    },
    Dual {
        left: TensorState,
        right: TensorState,
    },
}

/// Everything needed to resume one parameter verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamStateSnapshot {
    pub step: usize,
    pub mode: UpdateMode,
    pub exp_avg: TensorState,
    pub exp_avg_sq: TensorState,
    pub basis: Option<BasisState>,
    pub last_refresh: Option<usize>,
    pub refreshes: usize,
}

/// Full optimizer state: per-group hyperparameters and per-parameter records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaLoreState {
    pub groups: Vec<GaLoreConfig>,
    /// Parameter labels in registration order.
    pub labels: Vec<String>,
    /// `None` for parameters that have not been stepped yet.
    pub params: Vec<Option<ParamStateSnapshot>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_projected_moment_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let single = GaLoreConfig::default().with_rank(2);
        assert_eq!(ParamState::projected(8, 4, &single, &dev)?.exp_avg().dims(), &[8, 2]);
        assert_eq!(ParamState::projected(4, 8, &single, &dev)?.exp_avg().dims(), &[2, 8]);

        let dual = GaLoreConfig::dual(0.5).with_rank(3);
        assert_eq!(ParamState::projected(8, 4, &dual, &dev)?.exp_avg().dims(), &[3, 3]);

        // rank clamped to the smaller side
        let wide = GaLoreConfig::default().with_rank(64);
        assert_eq!(ParamState::projected(3, 5, &wide, &dev)?.exp_avg().dims(), &[3, 5]);
        Ok(())
    }

    #[test]
    fn test_fresh_state_is_zeroed_without_basis() -> Result<()> {
        let state = ParamState::projected(6, 6, &GaLoreConfig::default(), &Device::Cpu)?;
        assert_eq!(state.step(), 0);
        assert!(state.basis().is_none());
        assert_eq!(state.exp_avg_sq().sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_tensor_state_length_checked() {
        let snap = TensorState {
            shape: vec![2, 3],
            data: vec![0.0; 5],
        };
        assert!(matches!(
            snap.to_tensor(&Device::Cpu),
            Err(GaloreError::StateMismatch(_))
        ));
    }

    #[test]
    fn test_restore_rejects_wrong_moment_shape() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = GaLoreConfig::default().with_rank(2);
        let template = ParamState::projected(8, 4, &cfg, &dev)?;
        let other = ParamState::projected(4, 8, &cfg, &dev)?;
        let snap = other.export()?;
        assert!(
            ParamState::restore(&snap, &template, ProjectionKind::Single, (8, 4), &dev).is_err()
        );

        let ok = template.export()?;
        ParamState::restore(&ok, &template, ProjectionKind::Single, (8, 4), &dev)?;
        Ok(())
    }

    fn zeros_state(shape: &[usize]) -> TensorState {
        TensorState {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    fn snapshot_with_basis(moments: &[usize], basis: BasisState) -> ParamStateSnapshot {
        ParamStateSnapshot {
            step: 1,
            mode: UpdateMode::Projected,
            exp_avg: zeros_state(moments),
            exp_avg_sq: zeros_state(moments),
            basis: Some(basis),
            last_refresh: Some(1),
            refreshes: 1,
        }
    }

    #[test]
    fn test_restore_rejects_basis_rows_not_matching_param() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = GaLoreConfig::default().with_rank(2);
        // 4x8 parameter: Left basis, 4x2, moments 2x8
        let template = ParamState::projected(4, 8, &cfg, &dev)?;

        let good = snapshot_with_basis(
            &[2, 8],
            BasisState::Single {
                basis: zeros_state(&[4, 2]),
                side: ProjectionSide::Left,
            },
        );
        ParamState::restore(&good, &template, ProjectionKind::Single, (4, 8), &dev)?;

        let wrong_rows = snapshot_with_basis(
            &[2, 8],
            BasisState::Single {
                basis: zeros_state(&[7, 2]),
                side: ProjectionSide::Left,
            },
        );
        assert!(matches!(
            ParamState::restore(&wrong_rows, &template, ProjectionKind::Single, (4, 8), &dev),
            Err(GaloreError::StateMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_restore_rejects_wrong_side() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = GaLoreConfig::default().with_rank(4);
        // 4x4 parameter: Left, and a Right basis projects to the same 4x4 moments
        let template = ParamState::projected(4, 4, &cfg, &dev)?;
        let flipped = snapshot_with_basis(
            &[4, 4],
            BasisState::Single {
                basis: zeros_state(&[4, 4]),
                side: ProjectionSide::Right,
            },
        );
        assert!(matches!(
            ParamState::restore(&flipped, &template, ProjectionKind::Single, (4, 4), &dev),
            Err(GaloreError::StateMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_restore_rejects_dual_bases_with_wrong_rows() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = GaLoreConfig::dual(0.5).with_rank(2);
        let template = ParamState::projected(6, 3, &cfg, &dev)?;

        let good = snapshot_with_basis(
            &[2, 2],
            BasisState::Dual {
                left: zeros_state(&[6, 2]),
                right: zeros_state(&[3, 2]),
            },
        );
        ParamState::restore(&good, &template, ProjectionKind::Dual, (6, 3), &dev)?;

        let swapped = snapshot_with_basis(
            &[2, 2],
            BasisState::Dual {
                left: zeros_state(&[3, 2]),
                right: zeros_state(&[6, 2]),
            },
        );
        assert!(matches!(
            ParamState::restore(&swapped, &template, ProjectionKind::Dual, (6, 3), &dev),
            Err(GaloreError::StateMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_dense_state_full_shape() -> Result<()> {
        let p = Tensor::zeros(7, DType::F32, &Device::Cpu)?;
        let state = ParamState::dense(&p)?;
        assert_eq!(state.mode(), UpdateMode::Dense);
        assert_eq!(state.exp_avg().dims(), &[7]);
        Ok(())
    }
}
