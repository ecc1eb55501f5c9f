//! Optimizer and training checkpoint save/load.

use candle_nn::VarMap;
use galore_core::{GaLoreConfig, GaloreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::logging::{log_state_loaded, log_state_saved};
use crate::optim::{GaLore, GaLoreState};

pub const STATE_FILE: &str = "galore_state.json";
pub const CONFIG_FILE: &str = "galore_config.toml";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const META_FILE: &str = "meta.json";

const FORMAT_VERSION: u32 = 1;

/// On-disk wrapper around the exported optimizer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerCheckpoint {
    pub version: u32,
    /// Optimizer step calls made before saving.
    pub steps: usize,
    pub state: GaLoreState,
}

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub loss: f64,
}

/// Save optimizer state to a directory.
///
/// Creates:
///   - `<dir>/galore_state.json`: per-parameter moments, bases, step counters
///   - `<dir>/galore_config.toml`: hyperparameters of the first group
pub fn save_optimizer_state<P: AsRef<Path>>(opt: &GaLore, dir: P) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let checkpoint = OptimizerCheckpoint {
        version: FORMAT_VERSION,
        steps: opt.diagnostics().steps,
        state: opt.export_state()?,
    };
    let state_path = dir.join(STATE_FILE);
    std::fs::write(&state_path, serde_json::to_string(&checkpoint)?)?;

    if let Some(config) = opt.groups().first() {
        config.save(dir.join(CONFIG_FILE))?;
    }

    log_state_saved(checkpoint.steps, &state_path.display().to_string());
    Ok(state_path)
}

/// Restore optimizer state written by [`save_optimizer_state`].
///
/// Returns the number of optimizer steps recorded in the file.
pub fn load_optimizer_state<P: AsRef<Path>>(opt: &mut GaLore, dir: P) -> Result<usize> {
    let state_path = dir.as_ref().join(STATE_FILE);
    let json = std::fs::read_to_string(&state_path)?;
    let checkpoint: OptimizerCheckpoint = serde_json::from_str(&json)?;
    if checkpoint.version != FORMAT_VERSION {
        return Err(GaloreError::StateMismatch(format!(
            "unsupported optimizer state version {} (expected {})",
            checkpoint.version, FORMAT_VERSION
        )));
    }
    opt.import_state(&checkpoint.state)?;

    log_state_loaded(&state_path.display().to_string(), checkpoint.state.params.len());
    Ok(checkpoint.steps)
}

/// Read the config saved next to an optimizer state.
pub fn load_saved_config<P: AsRef<Path>>(dir: P) -> Result<GaLoreConfig> {
    GaLoreConfig::from_file(dir.as_ref().join(CONFIG_FILE))
}

/// Save model weights, metadata and optimizer state together.
///
/// Creates `model.safetensors`, `meta.json` and the optimizer files in `dir`.
pub fn save_checkpoint<P: AsRef<Path>>(
    varmap: &VarMap,
    opt: &GaLore,
    step: usize,
    loss: f64,
    dir: P,
) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    varmap.save(dir.join(WEIGHTS_FILE))?;
    let meta = CheckpointMeta { step, loss };
    std::fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;

    save_optimizer_state(opt, dir)?;
    Ok(())
}

/// Load weights into `varmap` and optimizer state into `opt`.
///
/// `opt` must have been built over the variables of `varmap`.
pub fn load_checkpoint<P: AsRef<Path>>(
    varmap: &mut VarMap,
    opt: &mut GaLore,
    dir: P,
) -> Result<CheckpointMeta> {
    let dir = dir.as_ref();
    let meta: CheckpointMeta =
        serde_json::from_str(&std::fs::read_to_string(dir.join(META_FILE))?)?;
    varmap.load(dir.join(WEIGHTS_FILE))?;
    load_optimizer_state(opt, dir)?;
    Ok(meta)
}
