//! Error types for the GaLore optimizer.
//!
//! Uses thiserror. Failures inside an optimizer step are wrapped in
//! [`GaloreError::Step`] so the caller always learns which parameter and
//! which stage of the update failed.

use std::fmt;

use thiserror::Error;

/// Stage of the per-parameter update at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepStage {
    /// Gradient layout and value checks.
    Validate,
    /// Subspace basis (re)computation, including smoothing.
    BasisRefresh,
    /// Gradient projection into the low-rank space.
    Projection,
    /// First/second moment accumulation.
    MomentUpdate,
    /// Mapping the adaptive update back to the parameter shape.
    BackProjection,
    /// Writing the new parameter value.
    Apply,
}

impl fmt::Display for StepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStage::Validate => "gradient validation",
            StepStage::BasisRefresh => "basis refresh",
            StepStage::Projection => "projection",
            StepStage::MomentUpdate => "moment update",
            StepStage::BackProjection => "back-projection",
            StepStage::Apply => "parameter apply",
        };
        f.write_str(name)
    }
}

/// Main error type for GaLore operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GaloreError {
    /// Hyperparameter outside its admissible range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sparse gradients are not supported by low-rank projection.
    #[error("GaLore does not support sparse gradients (parameter {param})")]
    SparseGradient { param: String },

    /// Gradient holds NaN or infinite entries.
    #[error("Gradient for parameter {param} contains non-finite values")]
    NonFiniteGradient { param: String },

    /// Tensor shape mismatch.
    #[error("Tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Both the randomized and the exact decomposition failed.
    #[error("SVD failed for {rows}x{cols} matrix at rank {rank}: {reason}")]
    Decomposition {
        rows: usize,
        cols: usize,
        rank: usize,
        reason: String,
    },

    /// A per-parameter step failed.
    #[error("Step failed for parameter {param} during {stage}: {source}")]
    Step {
        param: String,
        stage: StepStage,
        #[source]
        source: Box<GaloreError>,
    },

    /// Restored optimizer state does not fit the registered parameters.
    #[error("Optimizer state mismatch: {0}")]
    StateMismatch(String),

    /// Candle tensor library error.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, GaloreError>;

impl GaloreError {
    /// Wrap an error with the parameter and stage it occurred at.
    ///
    /// Already-wrapped errors are returned unchanged so the innermost stage wins.
    pub fn at_step(self, param: impl Into<String>, stage: StepStage) -> Self {
        match self {
            GaloreError::Step { .. } => self,
            other => GaloreError::Step {
                param: param.into(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Caller misuse: bad config or an unsupported gradient. Never retried.
    pub fn is_usage_error(&self) -> bool {
        match self {
            GaloreError::InvalidConfig(_)
            | GaloreError::SparseGradient { .. }
            | GaloreError::NonFiniteGradient { .. } => true,
            GaloreError::Step { source, .. } => source.is_usage_error(),
            _ => false,
        }
    }

    /// Check if error is recoverable (can retry).
    pub fn is_recoverable(&self) -> bool {
        match self {
            GaloreError::Io(_) => true,
            GaloreError::Step { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Label of the parameter a step failure belongs to.
    pub fn param(&self) -> Option<&str> {
        match self {
            GaloreError::Step { param, .. }
            | GaloreError::SparseGradient { param }
            | GaloreError::NonFiniteGradient { param } => Some(param),
            _ => None,
        }
    }

    /// Stage a step failure happened at.
    pub fn stage(&self) -> Option<StepStage> {
        match self {
            GaloreError::Step { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> GaloreError {
    GaloreError::InvalidConfig(message.into())
}
