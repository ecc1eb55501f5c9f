//! Low-rank projector: subspace bases from truncated SVD and the maps
//! into and out of the projected space.

use candle_core::Tensor;
use galore_core::{ProjectionKind, Result};

use super::svd::{matrix_to_tensor, tensor_to_matrix, truncated_svd, DecompositionPath, LowRankSolver};

/// Which side of the gradient a single basis multiplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionSide {
    /// m <= n: basis is m × r, `Pᵀ G` is r × n.
    Left,
    /// m > n: basis is n × r, `G P` is m × r.
    Right,
}

impl ProjectionSide {
    /// Orientation rule: the basis always lives on the smaller dimension.
    pub fn for_shape(rows: usize, cols: usize) -> Self {
        if rows <= cols {
            ProjectionSide::Left
        } else {
            ProjectionSide::Right
        }
    }
}

/// Current subspace of one parameter.
///
/// Tensors are immutable handles, so cloning one out of the optimizer never
/// gives write access to its state.
#[derive(Debug, Clone)]
pub enum ProjectionBasis {
    Single { basis: Tensor, side: ProjectionSide },
    /// `left` is m × r, `right` is n × r.
    Dual { left: Tensor, right: Tensor },
}

impl ProjectionBasis {
    pub fn kind(&self) -> ProjectionKind {
        match self {
            ProjectionBasis::Single { .. } => ProjectionKind::Single,
            ProjectionBasis::Dual { .. } => ProjectionKind::Dual,
        }
    }

    /// Number of basis columns.
    pub fn rank(&self) -> Result<usize> {
        let t = match self {
            ProjectionBasis::Single { basis, .. } => basis,
            ProjectionBasis::Dual { left, .. } => left,
        };
        Ok(t.dims2()?.1)
    }

    /// Shape of a projected (m, n) gradient.
    pub fn projected_shape(&self, rows: usize, cols: usize) -> Result<(usize, usize)> {
        let r = self.rank()?;
        Ok(match self {
            ProjectionBasis::Single { side: ProjectionSide::Left, .. } => (r, cols),
            ProjectionBasis::Single { side: ProjectionSide::Right, .. } => (rows, r),
            ProjectionBasis::Dual { right, .. } => (r, right.dims2()?.1),
        })
    }

    /// Map an (m, n) matrix into the subspace.
    pub fn project(&self, g: &Tensor) -> Result<Tensor> {
        let out = match self {
            ProjectionBasis::Single { basis, side: ProjectionSide::Left } => {
                basis.t()?.matmul(g)?
            }
            ProjectionBasis::Single { basis, side: ProjectionSide::Right } => g.matmul(basis)?,
            // Uᵀ G V
            ProjectionBasis::Dual { left, right } => left.t()?.matmul(g)?.matmul(right)?,
        };
        Ok(out)
    }

    /// Map a projected matrix back to the original (m, n) shape.
    pub fn project_back(&self, x: &Tensor) -> Result<Tensor> {
        let out = match self {
            ProjectionBasis::Single { basis, side: ProjectionSide::Left } => basis.matmul(x)?,
            ProjectionBasis::Single { basis, side: ProjectionSide::Right } => {
                x.matmul(&basis.t()?)?
            }
            // U X Vᵀ
            ProjectionBasis::Dual { left, right } => left.matmul(x)?.matmul(&right.t()?)?,
        };
        Ok(out)
    }

    /// Total number of stored basis elements.
    pub fn elem_count(&self) -> usize {
        match self {
            ProjectionBasis::Single { basis, .. } => basis.elem_count(),
            ProjectionBasis::Dual { left, right } => left.elem_count() + right.elem_count(),
        }
    }
}

/// Compute a fresh basis for a 2-D F32 gradient.
///
/// The effective rank is `min(rank, m, n)`; callers must accept a narrower
/// basis than requested.
pub fn compute_basis(
    solver: &dyn LowRankSolver,
    grad: &Tensor,
    rank: usize,
    kind: ProjectionKind,
) -> Result<(ProjectionBasis, DecompositionPath)> {
    let (rows, cols) = grad.dims2()?;
    let device = grad.device();

    match kind {
        ProjectionKind::Single => {
            let side = ProjectionSide::for_shape(rows, cols);
            let a = match side {
                ProjectionSide::Left => tensor_to_matrix(grad)?,
                // Decompose Gᵀ: its left singular vectors are G's right ones (n × r)
                ProjectionSide::Right => tensor_to_matrix(grad)?.transpose(),
            };
            let (factors, path) = truncated_svd(solver, &a, rank)?;
            let basis = matrix_to_tensor(&factors.u, device)?;
            Ok((ProjectionBasis::Single { basis, side }, path))
        }
        ProjectionKind::Dual => {
            let a = tensor_to_matrix(grad)?;
            let (factors, path) = truncated_svd(solver, &a, rank)?;
            let left = matrix_to_tensor(&factors.u, device)?;
            let right = matrix_to_tensor(&factors.v, device)?;
            Ok((ProjectionBasis::Dual { left, right }, path))
        }
    }
}
