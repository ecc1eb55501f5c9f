pub mod galore;
pub mod gradient;
pub mod moments;
pub mod projector;
pub mod smoother;
pub mod state;
pub mod svd;

pub use galore::{GaLore, MemoryStats, OptimizerDiagnostics, ParamGroup};
pub use gradient::{Gradient, SparseGradient};
pub use moments::{BiasCorrection, MomentTracker};
pub use projector::{compute_basis, ProjectionBasis, ProjectionSide};
pub use smoother::{smooth, smooth_basis};
pub use state::{BasisState, GaLoreState, ParamState, ParamStateSnapshot, TensorState, UpdateMode};
pub use svd::{truncated_svd, DecompositionPath, LowRankSolver, NalgebraSolver, SvdFactors};
