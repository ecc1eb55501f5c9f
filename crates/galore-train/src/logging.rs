//! Structured logging for GaLore training runs with tracing.
//!
//! The optimizer itself emits `svd_fallback` warnings and `basis_refresh`
//! debug events; the helpers here cover run-level summaries.

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::optim::{MemoryStats, OptimizerDiagnostics};

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to "info").
/// Outputs JSON-formatted logs for production monitoring.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,galore_train=info,galore_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Structured logging initialized");
}

/// Initialize simple console logging (for demos/debugging).
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,galore_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// Per-step numbers reported by a training driver.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub loss: f64,
    pub learning_rate: f64,
    /// Gradient norm (L2) before the optimizer step.
    pub grad_norm: f64,
    /// Optimizer state relative to full Adam.
    pub state_ratio: f64,
}

impl StepMetrics {
    pub fn new(loss: f64, learning_rate: f64, grad_norm: f64) -> Self {
        Self {
            loss,
            learning_rate,
            grad_norm,
            state_ratio: 0.0,
        }
    }

    pub fn with_state_ratio(mut self, ratio: f64) -> Self {
        self.state_ratio = ratio;
        self
    }
}

/// Log a training step; a NaN/infinite loss is reported as divergence.
pub fn log_training_step(step: usize, metrics: &StepMetrics) {
    let span = span!(Level::INFO, "training_step", step = step);
    let _enter = span.enter();

    if !metrics.loss.is_finite() {
        error!(
            loss = metrics.loss,
            step = step,
            event = "divergence",
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        loss = metrics.loss,
        lr = metrics.learning_rate,
        grad_norm = metrics.grad_norm,
        state_ratio = metrics.state_ratio,
        "Training step completed"
    );
}

/// Log optimizer memory and event counters.
pub fn log_optimizer_summary(memory: &MemoryStats, diagnostics: &OptimizerDiagnostics) {
    info!(
        param_elems = memory.param_elems,
        full_adam_elems = memory.full_adam_elems,
        state_elems = memory.total_state_elems(),
        basis_elems = memory.basis_elems,
        state_ratio = memory.state_ratio(),
        steps = diagnostics.steps,
        basis_refreshes = diagnostics.basis_refreshes,
        smoothed_refreshes = diagnostics.smoothed_refreshes,
        dense_updates = diagnostics.dense_updates,
        event = "optimizer_summary",
        "GaLore optimizer summary"
    );

    if diagnostics.svd_fallbacks > 0 {
        warn!(
            svd_fallbacks = diagnostics.svd_fallbacks,
            basis_refreshes = diagnostics.basis_refreshes,
            event = "svd_fallback_summary",
            "Randomized SVD needed the exact fallback; consider more power iterations"
        );
    }

    debug!(
        projected_moment_elems = memory.projected_moment_elems,
        dense_moment_elems = memory.dense_moment_elems,
        "Optimizer state breakdown"
    );
}

/// Log optimizer state persistence.
pub fn log_state_saved(step: usize, path: &str) {
    info!(
        step = step,
        path = path,
        event = "optimizer_state_saved",
        "Optimizer state saved successfully"
    );
}

pub fn log_state_loaded(path: &str, params: usize) {
    info!(
        path = path,
        params = params,
        event = "optimizer_state_loaded",
        "Optimizer state restored"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = StepMetrics::new(2.5, 0.001, 1.2).with_state_ratio(0.25);
        assert_eq!(metrics.loss, 2.5);
        assert_eq!(metrics.state_ratio, 0.25);
    }

    #[test]
    fn test_logging_does_not_panic() {
        log_training_step(10, &StepMetrics::new(f64::NAN, 0.001, 1.0));
        log_training_step(11, &StepMetrics::new(1.5, 0.001, 1.0));

        let memory = MemoryStats {
            param_elems: 100,
            full_adam_elems: 200,
            projected_moment_elems: 20,
            dense_moment_elems: 0,
            basis_elems: 10,
        };
        let diagnostics = OptimizerDiagnostics {
            steps: 5,
            basis_refreshes: 2,
            svd_fallbacks: 1,
            ..Default::default()
        };
        log_optimizer_summary(&memory, &diagnostics);
        log_state_saved(5, "/tmp/galore");
        log_state_loaded("/tmp/galore", 3);
    }
}
