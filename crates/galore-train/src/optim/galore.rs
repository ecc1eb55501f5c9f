//! GaLore: Adam with moments kept in a low-rank gradient subspace.
//!
//! Each matrix parameter keeps a truncated-SVD basis of its recent gradient,
//! refreshed every `refresh_interval` steps. Gradients are projected into the
//! basis, Adam runs on the small projected tensor, and the normalized update
//! is projected back before being applied. Optimizer memory for an m×n matrix
//! drops from 2·m·n to 2·r·max(m, n) (single basis) or 2·r² (dual basis).

use candle_core::{backprop::GradStore, DType, Tensor, TensorId, Var};
use candle_nn::VarMap;
use galore_core::{validate_lr, GaLoreConfig, GaloreError, ProjectionKind, Result, StepStage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::gradient::Gradient;
use super::moments::BiasCorrection;
use super::projector::{compute_basis, ProjectionBasis};
use super::smoother::smooth_basis;
use super::state::{GaLoreState, ParamState, UpdateMode};
use super::svd::{DecompositionPath, LowRankSolver, NalgebraSolver};

/// A set of parameters sharing one hyperparameter configuration.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub config: GaLoreConfig,
    params: Vec<(Option<String>, Var)>,
}

impl ParamGroup {
    pub fn new(vars: Vec<Var>, config: GaLoreConfig) -> Self {
        Self {
            config,
            params: vars.into_iter().map(|v| (None, v)).collect(),
        }
    }

    /// Group whose parameters carry names used in errors and logs.
    pub fn named(vars: Vec<(String, Var)>, config: GaLoreConfig) -> Self {
        Self {
            config,
            params: vars.into_iter().map(|(n, v)| (Some(n), v)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Non-fatal events counted across steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerDiagnostics {
    /// Optimizer-level step calls.
    pub steps: usize,
    /// Basis recomputations, smoothed or not.
    pub basis_refreshes: usize,
    /// Refreshes blended into a previous dual basis.
    pub smoothed_refreshes: usize,
    /// Randomized SVD failures recovered by the exact path.
    pub svd_fallbacks: usize,
    /// Parameter updates done with plain Adam.
    pub dense_updates: usize,
}

impl OptimizerDiagnostics {
    fn record(&mut self, outcome: &StepOutcome) {
        if outcome.refreshed {
            self.basis_refreshes += 1;
        }
        if outcome.smoothed {
            self.smoothed_refreshes += 1;
        }
        if outcome.path == Some(DecompositionPath::ExactFallback) {
            self.svd_fallbacks += 1;
        }
        if outcome.state.mode == UpdateMode::Dense {
            self.dense_updates += 1;
        }
    }
}

/// Optimizer-state element counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Elements across all registered parameters.
    pub param_elems: usize,
    /// What Adam would store for the same parameters (2 per element).
    pub full_adam_elems: usize,
    /// Moment elements held for projected parameters.
    pub projected_moment_elems: usize,
    /// Moment elements held for dense-Adam parameters.
    pub dense_moment_elems: usize,
    /// Stored basis elements.
    pub basis_elems: usize,
}

impl MemoryStats {
    pub fn total_state_elems(&self) -> usize {
        self.projected_moment_elems + self.dense_moment_elems + self.basis_elems
    }

    /// Fraction of the Adam footprint currently in use.
    pub fn state_ratio(&self) -> f64 {
        if self.full_adam_elems == 0 {
            return 0.0;
        }
        self.total_state_elems() as f64 / self.full_adam_elems as f64
    }
}

/// How a parameter is viewed by the update engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Matrix { rows: usize, cols: usize },
    Dense,
}

impl Layout {
    fn for_param(dims: &[usize], config: &GaLoreConfig) -> Self {
        if dims.len() < 2 {
            return Layout::Dense;
        }
        let rows = dims[0];
        let cols: usize = dims[1..].iter().product();
        if rows.min(cols) < config.min_dim.max(1) {
            Layout::Dense
        } else {
            Layout::Matrix { rows, cols }
        }
    }

    fn fresh_state(&self, var: &Var, config: &GaLoreConfig) -> Result<ParamState> {
        match *self {
            Layout::Matrix { rows, cols } => ParamState::projected(rows, cols, config, var.device()),
            Layout::Dense => ParamState::dense(var.as_tensor()),
        }
    }
}

#[derive(Debug)]
struct Slot {
    var: Var,
    label: String,
    group: usize,
    layout: Layout,
    state: Option<ParamState>,
}

/// Everything a step computed for one parameter, before anything is written.
struct StepOutcome {
    index: usize,
    new_value: Tensor,
    state: ParamState,
    refreshed: bool,
    smoothed: bool,
    path: Option<DecompositionPath>,
}

/// GaLore optimizer over a fixed set of candle variables.
pub struct GaLore {
    slots: Vec<Slot>,
    index: HashMap<TensorId, usize>,
    groups: Vec<GaLoreConfig>,
    solver: Arc<dyn LowRankSolver>,
    diagnostics: OptimizerDiagnostics,
}

impl GaLore {
    pub fn new(vars: Vec<Var>, config: GaLoreConfig) -> Result<Self> {
        let solver = Arc::new(NalgebraSolver::new(&config.svd));
        Self::with_groups(vec![ParamGroup::new(vars, config)], solver)
    }

    /// Use a custom decomposition backend.
    pub fn with_solver(
        vars: Vec<Var>,
        config: GaLoreConfig,
        solver: Arc<dyn LowRankSolver>,
    ) -> Result<Self> {
        Self::with_groups(vec![ParamGroup::new(vars, config)], solver)
    }

    /// Register every variable of a `VarMap`, labelled by name.
    pub fn from_varmap(varmap: &VarMap, config: GaLoreConfig) -> Result<Self> {
        let mut named: Vec<(String, Var)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| GaloreError::InvalidConfig("var map lock poisoned".into()))?;
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        named.sort_by(|a, b| a.0.cmp(&b.0));
        let solver = Arc::new(NalgebraSolver::new(&config.svd));
        Self::with_groups(vec![ParamGroup::named(named, config)], solver)
    }

    /// Build from parameter groups; every group config is validated.
    pub fn with_groups(groups: Vec<ParamGroup>, solver: Arc<dyn LowRankSolver>) -> Result<Self> {
        let mut slots = Vec::new();
        let mut index = HashMap::new();
        let mut configs = Vec::with_capacity(groups.len());

        for (group_idx, group) in groups.into_iter().enumerate() {
            group.config.validate()?;
            for (name, var) in group.params {
                let id = var.as_tensor().id();
                let label = name.unwrap_or_else(|| format!("param.{}", slots.len()));
                if index.insert(id, slots.len()).is_some() {
                    return Err(GaloreError::InvalidConfig(format!(
                        "parameter {} registered more than once",
                        label
                    )));
                }
                let layout = Layout::for_param(var.dims(), &group.config);
                slots.push(Slot {
                    var,
                    label,
                    group: group_idx,
                    layout,
                    state: None,
                });
            }
            configs.push(group.config);
        }

        Ok(Self {
            slots,
            index,
            groups: configs,
            solver,
            diagnostics: OptimizerDiagnostics::default(),
        })
    }

    /// Step every parameter that has a gradient in `grads`.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let work: Vec<(usize, Gradient)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                grads
                    .get(slot.var.as_tensor())
                    .map(|g| (i, Gradient::Dense(g.clone())))
            })
            .collect();
        self.run(work)
    }

    /// Step with gradients keyed by tensor id. Unknown ids are ignored.
    pub fn step_with_grads(&mut self, grads: &HashMap<TensorId, Gradient>) -> Result<()> {
        let work: Vec<(usize, Gradient)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                grads
                    .get(&slot.var.as_tensor().id())
                    .map(|g| (i, g.clone()))
            })
            .collect();
        self.run(work)
    }

    /// Step a single parameter.
    ///
    /// On error neither the parameter nor its state has changed, so callers
    /// can skip it and continue with the rest of the model.
    pub fn step_param(&mut self, var: &Var, grad: &Gradient) -> Result<()> {
        let idx = self.slot_index(var)?;
        let outcome = self.compute(idx, grad)?;
        self.commit(outcome)
    }

    fn run(&mut self, work: Vec<(usize, Gradient)>) -> Result<()> {
        self.diagnostics.steps += 1;
        let parallel = self.groups.iter().any(|g| g.parallel);

        if parallel {
            let this = &*self;
            let outcomes: Vec<Result<StepOutcome>> = work
                .par_iter()
                .map(|(idx, grad)| this.compute(*idx, grad))
                .collect();
            // Commit in registration order, stopping where a sequential pass would.
            for outcome in outcomes {
                self.commit(outcome?)?;
            }
        } else {
            for (idx, grad) in &work {
                let outcome = self.compute(*idx, grad)?;
                self.commit(outcome)?;
            }
        }
        Ok(())
    }

    /// Compute the next parameter value and state without touching either.
    fn compute(&self, idx: usize, grad: &Gradient) -> Result<StepOutcome> {
        let slot = &self.slots[idx];
        let config = &self.groups[slot.group];
        let label = slot.label.as_str();

        let g = validate_gradient(label, &slot.var, grad)
            .map_err(|e| e.at_step(label, StepStage::Validate))?;

        let prev = match &slot.state {
            Some(state) => state.clone(),
            None => slot
                .layout
                .fresh_state(&slot.var, config)
                .map_err(|e| e.at_step(label, StepStage::Validate))?,
        };

        match slot.layout {
            Layout::Matrix { rows, cols } => {
                self.compute_projected(idx, label, &slot.var, g, rows, cols, prev, config)
            }
            Layout::Dense => compute_dense(idx, label, &slot.var, g, prev, config),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_projected(
        &self,
        idx: usize,
        label: &str,
        var: &Var,
        grad: Tensor,
        rows: usize,
        cols: usize,
        prev: ParamState,
        config: &GaLoreConfig,
    ) -> Result<StepOutcome> {
        let step = prev.step + 1;
        let g2 = grad
            .reshape((rows, cols))
            .map_err(|e| GaloreError::from(e).at_step(label, StepStage::Validate))?;

        let stale = step % config.refresh_interval == 0;
        let (basis, refreshed, smoothed, path, refreshes) = match prev.basis.as_ref() {
            Some(current) if !stale => (current.clone(), false, false, None, prev.refreshes),
            current => {
                let (fresh, path) =
                    compute_basis(self.solver.as_ref(), &g2, config.rank, config.projection)
                        .map_err(|e| e.at_step(label, StepStage::BasisRefresh))?;
                let (basis, smoothed) = match (current, config.smoothing_decay) {
                    (Some(old), Some(decay)) if config.projection == ProjectionKind::Dual => (
                        smooth_basis(old, fresh, decay)
                            .map_err(|e| e.at_step(label, StepStage::BasisRefresh))?,
                        true,
                    ),
                    _ => (fresh, false),
                };
                tracing::debug!(
                    param = label,
                    step = step,
                    rank = basis.rank().unwrap_or(0),
                    smoothed = smoothed,
                    fallback = path == DecompositionPath::ExactFallback,
                    event = "basis_refresh",
                    "Projection basis refreshed"
                );
                (basis, true, smoothed, Some(path), prev.refreshes + 1)
            }
        };

        let param = var
            .as_tensor()
            .to_dtype(DType::F32)
            .and_then(|p| p.reshape((rows, cols)))
            .map_err(|e| GaloreError::from(e).at_step(label, StepStage::Projection))?;
        let projected = project_gradient(&basis, &g2, &param, config.weight_decay)
            .map_err(|e| e.at_step(label, StepStage::Projection))?;

        let (beta1, beta2) = config.betas;
        let (moments, direction) = prev
            .moments
            .advance(&projected, beta1, beta2, config.eps)
            .map_err(|e| e.at_step(label, StepStage::MomentUpdate))?;

        let back = basis
            .project_back(&direction)
            .map_err(|e| e.at_step(label, StepStage::BackProjection))?;

        let step_size = BiasCorrection::at_step(beta1, beta2, step).step_size(config.lr) * config.alpha;
        let new_value = apply_delta(var, &back, step_size)
            .map_err(|e| e.at_step(label, StepStage::Apply))?;

        Ok(StepOutcome {
            index: idx,
            new_value,
            state: ParamState {
                step,
                mode: UpdateMode::Projected,
                moments,
                basis: Some(basis),
                last_refresh: if refreshed { Some(step) } else { prev.last_refresh },
                refreshes,
            },
            refreshed,
            smoothed,
            path,
        })
    }

    /// Write the parameter first; the state is only replaced once that succeeded.
    fn commit(&mut self, outcome: StepOutcome) -> Result<()> {
        let slot = &mut self.slots[outcome.index];
        slot.var
            .set(&outcome.new_value)
            .map_err(|e| GaloreError::from(e).at_step(slot.label.as_str(), StepStage::Apply))?;
        self.diagnostics.record(&outcome);
        slot.state = Some(outcome.state);
        Ok(())
    }

    fn slot_index(&self, var: &Var) -> Result<usize> {
        self.index
            .get(&var.as_tensor().id())
            .copied()
            .ok_or_else(|| GaloreError::InvalidConfig("parameter is not registered with this optimizer".into()))
    }

    /// Current basis of every parameter that has one.
    pub fn projection_bases(&self) -> HashMap<TensorId, ProjectionBasis> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let basis = slot.state.as_ref()?.basis()?;
                Some((slot.var.as_tensor().id(), basis.clone()))
            })
            .collect()
    }

    /// Read-only view of a parameter's state; `None` before its first step.
    pub fn param_state(&self, var: &Var) -> Option<&ParamState> {
        let idx = *self.index.get(&var.as_tensor().id())?;
        self.slots[idx].state.as_ref()
    }

    /// Label assigned to a registered parameter.
    pub fn param_label(&self, var: &Var) -> Option<&str> {
        let idx = *self.index.get(&var.as_tensor().id())?;
        Some(self.slots[idx].label.as_str())
    }

    pub fn num_params(&self) -> usize {
        self.slots.len()
    }

    pub fn groups(&self) -> &[GaLoreConfig] {
        &self.groups
    }

    /// Learning rate of the first group.
    pub fn lr(&self) -> f64 {
        self.groups.first().map(|g| g.lr).unwrap_or(0.0)
    }

    /// Set the learning rate of every group (e.g. from a schedule).
    ///
    /// A negative or non-finite rate is rejected and leaves every group unchanged.
    pub fn set_lr(&mut self, lr: f64) -> Result<()> {
        validate_lr(lr)?;
        for group in &mut self.groups {
            group.lr = lr;
        }
        Ok(())
    }

    pub fn set_group_lr(&mut self, group: usize, lr: f64) -> Result<()> {
        validate_lr(lr)?;
        let count = self.groups.len();
        let config = self.groups.get_mut(group).ok_or_else(|| {
            GaloreError::InvalidConfig(format!("group {} out of range ({} groups)", group, count))
        })?;
        config.lr = lr;
        Ok(())
    }

    pub fn diagnostics(&self) -> OptimizerDiagnostics {
        self.diagnostics
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();
        for slot in &self.slots {
            let elems = slot.var.elem_count();
            stats.param_elems += elems;
            stats.full_adam_elems += 2 * elems;
            if let Some(state) = &slot.state {
                let moments = state.exp_avg().elem_count() + state.exp_avg_sq().elem_count();
                match state.mode() {
                    UpdateMode::Projected => stats.projected_moment_elems += moments,
                    UpdateMode::Dense => stats.dense_moment_elems += moments,
                }
                if let Some(basis) = state.basis() {
                    stats.basis_elems += basis.elem_count();
                }
            }
        }
        stats
    }

    pub fn export_state(&self) -> Result<GaLoreState> {
        let params = self
            .slots
            .iter()
            .map(|slot| slot.state.as_ref().map(|s| s.export()).transpose())
            .collect::<Result<Vec<_>>>()?;
        Ok(GaLoreState {
            groups: self.groups.clone(),
            labels: self.slots.iter().map(|s| s.label.clone()).collect(),
            params,
        })
    }

    /// Restore a previously exported state.
    ///
    /// Everything is validated before anything is replaced; on error the
    /// optimizer is unchanged.
    pub fn import_state(&mut self, state: &GaLoreState) -> Result<()> {
        if state.groups.len() != self.groups.len() {
            return Err(GaloreError::StateMismatch(format!(
                "expected {} parameter groups, got {}",
                self.groups.len(),
                state.groups.len()
            )));
        }
        if state.params.len() != self.slots.len() || state.labels.len() != self.slots.len() {
            return Err(GaloreError::StateMismatch(format!(
                "expected {} parameters, got {} states and {} labels",
                self.slots.len(),
                state.params.len(),
                state.labels.len()
            )));
        }
        for (i, (current, saved)) in self.groups.iter().zip(&state.groups).enumerate() {
            saved.validate()?;
            // The solver is built from the svd section at construction.
            if current.projection != saved.projection
                || current.rank != saved.rank
                || current.min_dim != saved.min_dim
                || current.svd != saved.svd
            {
                return Err(GaloreError::StateMismatch(format!(
                    "group {}: projection/rank/min_dim/svd differ from the running optimizer",
                    i
                )));
            }
        }

        let mut restored = Vec::with_capacity(self.slots.len());
        for (slot, (label, snap)) in self.slots.iter().zip(state.labels.iter().zip(&state.params)) {
            if &slot.label != label {
                return Err(GaloreError::StateMismatch(format!(
                    "parameter label mismatch: expected {}, got {}",
                    slot.label, label
                )));
            }
            let Some(snap) = snap else {
                restored.push(None);
                continue;
            };
            let config = &self.groups[slot.group];
            let template = slot.layout.fresh_state(&slot.var, config)?;
            let matrix_shape = match slot.layout {
                Layout::Matrix { rows, cols } => (rows, cols),
                Layout::Dense => (0, 0),
            };
            let state = ParamState::restore(
                snap,
                &template,
                config.projection,
                matrix_shape,
                slot.var.device(),
            )
            .map_err(|e| match e {
                GaloreError::StateMismatch(msg) => {
                    GaloreError::StateMismatch(format!("{}: {}", slot.label, msg))
                }
                other => other,
            })?;
            restored.push(Some(state));
        }

        for (slot, state) in self.slots.iter_mut().zip(restored) {
            slot.state = state;
        }
        self.groups = state.groups.clone();
        Ok(())
    }
}

/// Dense F32 gradient matching the parameter's shape, or a usage error.
fn validate_gradient(label: &str, var: &Var, grad: &Gradient) -> Result<Tensor> {
    let g = match grad {
        Gradient::Sparse(_) => {
            return Err(GaloreError::SparseGradient {
                param: label.to_string(),
            })
        }
        Gradient::Dense(t) => t,
    };
    if g.dims() != var.dims() {
        return Err(GaloreError::ShapeMismatch {
            expected: var.dims().to_vec(),
            actual: g.dims().to_vec(),
        });
    }
    let g = g.to_dtype(DType::F32)?;
    // x·0 is NaN exactly when x is not finite.
    let probe = (&g * 0.0)?.sum_all()?.to_scalar::<f32>()?;
    if !probe.is_finite() {
        return Err(GaloreError::NonFiniteGradient {
            param: label.to_string(),
        });
    }
    Ok(g)
}

/// Project the gradient and add weight decay on the projected parameter.
fn project_gradient(
    basis: &ProjectionBasis,
    grad: &Tensor,
    param: &Tensor,
    weight_decay: f64,
) -> Result<Tensor> {
    let projected = basis.project(grad)?;
    if weight_decay == 0.0 {
        return Ok(projected);
    }
    let decay = (basis.project(param)? * weight_decay)?;
    Ok((projected + decay)?)
}

/// `param - step_size · delta`, computed in the variable's own dtype.
///
/// Only the delta is cast, so the stored value never round-trips through F32.
fn apply_delta(var: &Var, delta: &Tensor, step_size: f64) -> Result<Tensor> {
    let delta = (delta * step_size)?
        .reshape(var.dims())?
        .to_dtype(var.dtype())?;
    Ok((var.as_tensor() - delta)?)
}

/// Plain Adam on the full shape, for vectors and small matrices.
fn compute_dense(
    idx: usize,
    label: &str,
    var: &Var,
    grad: Tensor,
    prev: ParamState,
    config: &GaLoreConfig,
) -> Result<StepOutcome> {
    let step = prev.step + 1;
    let param = var
        .as_tensor()
        .to_dtype(DType::F32)
        .map_err(|e| GaloreError::from(e).at_step(label, StepStage::MomentUpdate))?;

    let grad = if config.weight_decay == 0.0 {
        grad
    } else {
        (&param * config.weight_decay)
            .and_then(|d| grad + d)
            .map_err(|e| GaloreError::from(e).at_step(label, StepStage::MomentUpdate))?
    };

    let (beta1, beta2) = config.betas;
    let (moments, direction) = prev
        .moments
        .advance(&grad, beta1, beta2, config.eps)
        .map_err(|e| e.at_step(label, StepStage::MomentUpdate))?;

    let step_size = BiasCorrection::at_step(beta1, beta2, step).step_size(config.lr);
    let new_value = apply_delta(var, &direction, step_size)
        .map_err(|e| e.at_step(label, StepStage::Apply))?;

    Ok(StepOutcome {
        index: idx,
        new_value,
        state: ParamState {
            step,
            mode: UpdateMode::Dense,
            moments,
            basis: None,
            last_refresh: None,
            refreshes: 0,
        },
        refreshed: false,
        smoothed: false,
        path: None,
    })
}
