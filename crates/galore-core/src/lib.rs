//! Core types shared across the GaLore crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - Optimizer hyperparameters with TOML support

pub mod config;
pub mod error;

pub use config::{validate_lr, GaLoreConfig, ProjectionKind, SvdConfig};
pub use error::{GaloreError, Result, StepStage};
