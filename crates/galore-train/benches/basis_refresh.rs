//! Basis refresh cost: randomized range finder vs exact SVD, and a full
//! optimizer step on a refresh vs a reuse step.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use galore_core::GaLoreConfig;
use galore_train::optim::{GaLore, Gradient, LowRankSolver, NalgebraSolver};
use nalgebra::DMatrix;

fn gen_matrix(rows: usize, cols: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows, cols, |i, j| {
        let v = ((i * cols + j) as u32).wrapping_mul(2654435761) >> 16;
        (v % 200) as f64 / 100.0 - 1.0
    })
}

fn bench_decomposition(c: &mut Criterion) {
    let mut group = c.benchmark_group("svd");
    group.sample_size(10);
    let solver = NalgebraSolver::default();

    for &(rows, cols, rank) in &[(128usize, 256usize, 8usize), (256, 512, 16)] {
        let a = gen_matrix(rows, cols);
        let label = format!("{}x{}_r{}", rows, cols, rank);

        group.bench_with_input(BenchmarkId::new("randomized", &label), &a, |b, a| {
            b.iter(|| solver.randomized(a, rank));
        });
        group.bench_with_input(BenchmarkId::new("exact", &label), &a, |b, a| {
            b.iter(|| solver.exact(a, rank));
        });
    }

    group.finish();
}

fn bench_optimizer_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("galore_step");
    group.sample_size(10);
    let dev = Device::Cpu;

    for &refresh_interval in &[1usize, 1000] {
        let w = Var::zeros((256, 512), DType::F32, &dev).expect("var");
        let g = Tensor::randn(0.0f32, 1.0, (256, 512), &dev).expect("grad");
        let cfg = GaLoreConfig::default()
            .with_rank(16)
            .with_refresh_interval(refresh_interval);
        let mut opt = GaLore::new(vec![w.clone()], cfg).expect("optimizer");
        let grads: HashMap<_, _> = [(w.as_tensor().id(), Gradient::Dense(g))].into_iter().collect();

        let name = if refresh_interval == 1 { "refresh_every_step" } else { "reuse_basis" };
        group.bench_function(name, |b| {
            b.iter(|| opt.step_with_grads(&grads).expect("step"));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decomposition, bench_optimizer_step);
criterion_main!(benches);
