//! Command-line driver for the GaLore optimizer.
//!
//! Provides subcommands:
//! - demo: Fit a synthetic low-rank regression with GaLore
//! - init-config: Write a default optimizer config
//! - check-config: Validate a config file

use anyhow::Context;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use galore_core::{GaLoreConfig, ProjectionKind};
use galore_train::checkpoint::save_checkpoint;
use galore_train::logging::{init_console_logging, log_optimizer_summary, log_training_step, StepMetrics};
use galore_train::optim::GaLore;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "galore")]
#[command(about = "Low-rank gradient projection optimizer tools", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a linear layer on a synthetic low-rank target
    Demo {
        /// Optimizer config (TOML); defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output features of the layer
        #[arg(long, default_value = "256")]
        rows: usize,

        /// Input features of the layer
        #[arg(long, default_value = "128")]
        cols: usize,

        /// Rank of the hidden target map
        #[arg(long, default_value = "4")]
        true_rank: usize,

        /// Projection rank (overrides the config)
        #[arg(short, long)]
        rank: Option<usize>,

        /// Number of optimizer steps
        #[arg(short, long, default_value = "200")]
        steps: usize,

        /// Samples per batch
        #[arg(long, default_value = "64")]
        batch: usize,

        /// Learning rate (overrides the config)
        #[arg(long)]
        lr: Option<f64>,

        /// Use the dual-basis variant with this smoothing decay
        #[arg(long)]
        dual: Option<f64>,

        /// Log every N steps
        #[arg(long, default_value = "20")]
        log_every: usize,

        /// Directory to write a checkpoint to after training
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Write a default config file
    InitConfig {
        /// Destination path
        path: PathBuf,

        /// Write the dual-basis preset with this smoothing decay
        #[arg(long)]
        dual: Option<f64>,
    },

    /// Validate a config file and print it
    CheckConfig {
        /// Config path
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            config,
            rows,
            cols,
            true_rank,
            rank,
            steps,
            batch,
            lr,
            dual,
            log_every,
            save,
        } => {
            let mut cfg = match config {
                Some(path) => GaLoreConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                // Sized for the default 256×128 layer
                None => GaLoreConfig::default()
                    .with_rank(8)
                    .with_refresh_interval(50)
                    .with_lr(1e-2),
            };
            if let Some(decay) = dual {
                cfg.projection = ProjectionKind::Dual;
                cfg.smoothing_decay = Some(decay);
            }
            if let Some(rank) = rank {
                cfg = cfg.with_rank(rank);
            }
            if let Some(lr) = lr {
                cfg = cfg.with_lr(lr);
            }
            cfg.validate()?;

            init_console_logging();
            let shape = DemoShape {
                rows,
                cols,
                true_rank,
                batch,
            };
            run_demo(cfg, shape, steps, log_every.max(1), save.as_deref())?;
        }

        Commands::InitConfig { path, dual } => {
            let cfg = match dual {
                Some(decay) => GaLoreConfig::dual(decay),
                None => GaLoreConfig::default(),
            };
            cfg.save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote default config to {}", path.display());
        }

        Commands::CheckConfig { path } => {
            let cfg = GaLoreConfig::from_file(&path)
                .with_context(|| format!("invalid config {}", path.display()))?;
            println!("{} is valid", path.display());
            println!("{}", cfg);
        }
    }

    Ok(())
}

struct DemoShape {
    rows: usize,
    cols: usize,
    true_rank: usize,
    batch: usize,
}

fn run_demo(
    cfg: GaLoreConfig,
    shape: DemoShape,
    steps: usize,
    log_every: usize,
    save: Option<&Path>,
) -> anyhow::Result<()> {
    let device = Device::Cpu;

    // y = A B x with rank(A B) = true_rank
    let a = Tensor::randn(0.0f32, 1.0, (shape.rows, shape.true_rank), &device)?;
    let b = Tensor::randn(0.0f32, 1.0, (shape.true_rank, shape.cols), &device)?;
    let target = (a.matmul(&b)? / (shape.true_rank as f64).sqrt())?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let layer = candle_nn::linear(shape.cols, shape.rows, vb.pp("proj"))?;

    let mut opt = GaLore::from_varmap(&varmap, cfg)?;
    tracing::info!(
        params = opt.num_params(),
        rank = opt.groups()[0].rank,
        projection = ?opt.groups()[0].projection,
        "Starting GaLore demo"
    );

    let start = Instant::now();
    let mut last_loss = f64::NAN;
    for step in 1..=steps {
        let x = Tensor::randn(0.0f32, 1.0, (shape.batch, shape.cols), &device)?;
        let y = x.matmul(&target.t()?)?;
        let pred = layer.forward(&x)?;
        let loss = candle_nn::loss::mse(&pred, &y)?;
        let grads = loss.backward()?;

        let mut grad_sq = 0.0f64;
        for var in varmap.all_vars() {
            if let Some(g) = grads.get(var.as_tensor()) {
                grad_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }

        opt.step(&grads)?;
        last_loss = loss.to_scalar::<f32>()? as f64;

        if step % log_every == 0 || step == steps {
            let metrics = StepMetrics::new(last_loss, opt.lr(), grad_sq.sqrt())
                .with_state_ratio(opt.memory_stats().state_ratio());
            log_training_step(step, &metrics);
        }
    }

    log_optimizer_summary(&opt.memory_stats(), &opt.diagnostics());
    let stats = opt.memory_stats();
    println!(
        "Finished {} steps in {:.2}s: loss {:.5}, optimizer state {} elems ({:.1}% of Adam)",
        steps,
        start.elapsed().as_secs_f64(),
        last_loss,
        stats.total_state_elems(),
        stats.state_ratio() * 100.0
    );

    if let Some(dir) = save {
        save_checkpoint(&varmap, &opt, steps, last_loss, dir)
            .with_context(|| format!("saving checkpoint to {}", dir.display()))?;
        println!("Checkpoint written to {}", dir.display());
    }

    Ok(())
}
