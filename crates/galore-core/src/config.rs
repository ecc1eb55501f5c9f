//! GaLore hyperparameters with TOML load/save.
//!
//! Every constructor path of the optimizer calls [`GaLoreConfig::validate`],
//! so an out-of-range value is rejected before any state is allocated.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{config_error, GaloreError, Result};

fn default_lr() -> f64 {
    1e-3
}

fn default_betas() -> (f64, f64) {
    (0.9, 0.999)
}

fn default_eps() -> f64 {
    1e-8
}

fn default_rank() -> usize {
    128
}

fn default_refresh_interval() -> usize {
    200 // recompute the subspace every 200 steps
}

fn default_alpha() -> f64 {
    0.25
}

fn default_oversample() -> usize {
    8
}

fn default_power_iters() -> usize {
    2
}

fn default_max_iters() -> usize {
    100
}

fn default_exact_max_iters() -> usize {
    10_000
}

/// Which projection the optimizer applies to 2-D parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    /// One basis on the smaller side: (m, n) -> (r, n) or (m, r).
    #[default]
    Single,
    /// Left and right bases: (m, n) -> (r, r).
    Dual,
}

/// Truncated SVD settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvdConfig {
    /// Extra sketch columns for the randomized range finder.
    #[serde(default = "default_oversample")]
    pub oversample: usize,
    /// Subspace (power) iterations after the initial sketch.
    #[serde(default = "default_power_iters")]
    pub power_iters: usize,
    /// Iteration cap of the small SVD on the randomized path.
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
    /// Iteration cap of the exact fallback SVD.
    #[serde(default = "default_exact_max_iters")]
    pub exact_max_iters: usize,
    /// Seed of the Gaussian sketch.
    #[serde(default)]
    pub seed: u64,
}

impl Default for SvdConfig {
    fn default() -> Self {
        Self {
            oversample: default_oversample(),
            power_iters: default_power_iters(),
            max_iters: default_max_iters(),
            exact_max_iters: default_exact_max_iters(),
            seed: 0,
        }
    }
}

/// Optimizer hyperparameters for one parameter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaLoreConfig {
    /// Learning rate.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// First and second moment decay rates.
    #[serde(default = "default_betas")]
    pub betas: (f64, f64),
    /// Denominator stabilizer.
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Weight decay coefficient, added to the projected gradient.
    #[serde(default)]
    pub weight_decay: f64,
    /// Target rank of the projection.
    #[serde(default = "default_rank")]
    pub rank: usize,
    /// Steps between basis recomputations.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: usize,
    /// Scale applied to the back-projected update.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Single- or dual-basis projection.
    #[serde(default)]
    pub projection: ProjectionKind,
    /// EMA decay blending a fresh basis pair into the stored one (dual only).
    #[serde(default)]
    pub smoothing_decay: Option<f64>,
    /// Parameters whose smaller dimension is below this get dense Adam.
    #[serde(default)]
    pub min_dim: usize,
    /// Truncated SVD settings.
    #[serde(default)]
    pub svd: SvdConfig,
    /// Step parameters on the rayon pool.
    #[serde(default)]
    pub parallel: bool,
}

impl Default for GaLoreConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            betas: default_betas(),
            eps: default_eps(),
            weight_decay: 0.0,
            rank: default_rank(),
            refresh_interval: default_refresh_interval(),
            alpha: default_alpha(),
            projection: ProjectionKind::Single,
            smoothing_decay: None,
            min_dim: 0,
            svd: SvdConfig::default(),
            parallel: false,
        }
    }
}

impl GaLoreConfig {
    /// Settings from the GaLore paper for LLaMA pre-training.
    pub fn paper() -> Self {
        Self {
            lr: 0.01,
            rank: 128,
            refresh_interval: 200,
            alpha: 0.25,
            ..Default::default()
        }
    }

    /// Dual-basis projection with EMA smoothing of the bases.
    pub fn dual(smoothing_decay: f64) -> Self {
        Self {
            projection: ProjectionKind::Dual,
            smoothing_decay: Some(smoothing_decay),
            ..Default::default()
        }
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.betas = (beta1, beta2);
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_refresh_interval(mut self, steps: usize) -> Self {
        self.refresh_interval = steps;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_min_dim(mut self, min_dim: usize) -> Self {
        self.min_dim = min_dim;
        self
    }

    pub fn with_svd(mut self, svd: SvdConfig) -> Self {
        self.svd = svd;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Validate hyperparameter ranges.
    pub fn validate(&self) -> Result<()> {
        validate_lr(self.lr)?;
        if !self.eps.is_finite() || self.eps < 0.0 {
            return Err(config_error(format!("Invalid epsilon value: {}", self.eps)));
        }
        let (beta1, beta2) = self.betas;
        if !(0.0..1.0).contains(&beta1) {
            return Err(config_error(format!(
                "Invalid beta parameter at index 0: {}",
                beta1
            )));
        }
        if !(0.0..1.0).contains(&beta2) {
            return Err(config_error(format!(
                "Invalid beta parameter at index 1: {}",
                beta2
            )));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(config_error(format!(
                "Invalid weight_decay value: {}",
                self.weight_decay
            )));
        }
        if self.rank == 0 {
            return Err(config_error("rank must be a positive integer"));
        }
        if self.refresh_interval == 0 {
            return Err(config_error("refresh_interval must be a positive integer"));
        }
        if !self.alpha.is_finite() {
            return Err(config_error(format!("Invalid alpha value: {}", self.alpha)));
        }
        match (self.projection, self.smoothing_decay) {
            (ProjectionKind::Dual, Some(decay)) if !(0.0..=1.0).contains(&decay) => {
                return Err(config_error(format!(
                    "smoothing_decay must be in [0, 1], got {}",
                    decay
                )));
            }
            (ProjectionKind::Single, Some(_)) => {
                return Err(config_error(
                    "smoothing_decay only applies to the dual-basis projection",
                ));
            }
            _ => {}
        }
        if self.svd.max_iters == 0 {
            return Err(config_error("svd.max_iters must be > 0"));
        }
        if self.svd.exact_max_iters == 0 {
            return Err(config_error("svd.exact_max_iters must be > 0"));
        }
        Ok(())
    }

    /// Load configuration from TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GaloreError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file {}: {}", path.as_ref().display(), e),
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

/// Learning rates must be finite and non-negative.
pub fn validate_lr(lr: f64) -> Result<()> {
    if !lr.is_finite() || lr < 0.0 {
        return Err(config_error(format!("Invalid learning rate: {}", lr)));
    }
    Ok(())
}

impl std::fmt::Display for GaLoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GaLore[{:?}] lr={} betas=({}, {}) eps={} wd={} rank={} gap={} alpha={}",
            self.projection,
            self.lr,
            self.betas.0,
            self.betas.1,
            self.eps,
            self.weight_decay,
            self.rank,
            self.refresh_interval,
            self.alpha
        )?;
        if let Some(decay) = self.smoothing_decay {
            write!(f, " smoothing={}", decay)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_valid() {
        GaLoreConfig::default().validate().unwrap();
        GaLoreConfig::paper().validate().unwrap();
        GaLoreConfig::dual(0.9).validate().unwrap();
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let bad = [
            GaLoreConfig::default().with_lr(-1.0),
            GaLoreConfig::default().with_eps(-1e-8),
            GaLoreConfig::default().with_betas(1.0, 0.999),
            GaLoreConfig::default().with_betas(0.9, -0.1),
            GaLoreConfig::default().with_weight_decay(-0.1),
            GaLoreConfig::default().with_rank(0),
            GaLoreConfig::default().with_refresh_interval(0),
            GaLoreConfig::default().with_alpha(f64::NAN),
            GaLoreConfig::dual(1.5),
        ];
        for cfg in bad {
            let err = cfg.validate().unwrap_err();
            assert!(err.is_usage_error(), "{} should be a usage error", err);
        }
    }

    #[test]
    fn test_smoothing_rejected_on_single_basis() {
        let cfg = GaLoreConfig {
            smoothing_decay: Some(0.5),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_smoothing_bounds_inclusive() {
        GaLoreConfig::dual(0.0).validate().unwrap();
        GaLoreConfig::dual(1.0).validate().unwrap();
    }

    #[test]
    fn test_zero_iteration_caps_rejected() {
        let mut cfg = GaLoreConfig::default();
        cfg.svd.max_iters = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = GaLoreConfig::default();
        cfg.svd.exact_max_iters = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("exact_max_iters"));
    }

    #[test]
    fn test_lr_validation() {
        validate_lr(0.0).unwrap();
        validate_lr(3e-4).unwrap();
        assert!(validate_lr(-1.0).is_err());
        assert!(validate_lr(f64::NAN).is_err());
        assert!(validate_lr(f64::INFINITY).is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = GaLoreConfig::dual(0.8).with_rank(16).with_weight_decay(0.01);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        cfg.save(tmp.path()).unwrap();
        let loaded = GaLoreConfig::from_file(tmp.path()).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: GaLoreConfig = toml::from_str("rank = 4\nprojection = \"dual\"\n").unwrap();
        assert_eq!(cfg.rank, 4);
        assert_eq!(cfg.projection, ProjectionKind::Dual);
        assert_eq!(cfg.refresh_interval, 200);
        assert_eq!(cfg.betas, (0.9, 0.999));
    }
}
