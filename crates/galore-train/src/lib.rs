//! # GaLore training library
//!
//! Gradient low-rank projection for candle models: Adam moments live in a
//! subspace spanned by the top singular vectors of each weight's gradient,
//! cutting optimizer memory for large matrices.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use candle_core::{DType, Device, Var};
//! use galore_core::GaLoreConfig;
//! use galore_train::optim::GaLore;
//!
//! # fn main() -> galore_core::Result<()> {
//! let w = Var::zeros((512, 256), DType::F32, &Device::Cpu)?;
//! let mut opt = GaLore::new(vec![w.clone()], GaLoreConfig::paper())?;
//!
//! // let grads = loss.backward()?;
//! // opt.step(&grads)?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod logging;
pub mod optim;

pub use galore_core::{GaLoreConfig, GaloreError, ProjectionKind, Result, StepStage, SvdConfig};
pub use optim::{GaLore, Gradient, ParamGroup, ProjectionBasis};
