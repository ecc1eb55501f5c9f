//! Truncated SVD backends for subspace extraction.
//!
//! The update engine only talks to [`LowRankSolver`]; the numerical kernel is
//! nalgebra. A randomized range finder (Halko et al.) runs first and the exact
//! decomposition is the fallback when it does not converge.

use std::fmt;

use candle_core::{DType, Device, Tensor};
use galore_core::{GaloreError, Result, SvdConfig};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Leading singular triplets of a matrix, sorted by descending singular value.
#[derive(Debug, Clone)]
pub struct SvdFactors {
    /// Left singular vectors (m × k).
    pub u: DMatrix<f64>,
    /// Singular values (k).
    pub singular_values: DVector<f64>,
    /// Right singular vectors (n × k), i.e. V rather than Vᵀ.
    pub v: DMatrix<f64>,
}

impl SvdFactors {
    pub fn rank(&self) -> usize {
        self.singular_values.len()
    }

    fn is_finite(&self) -> bool {
        self.u.iter().all(|x| x.is_finite())
            && self.v.iter().all(|x| x.is_finite())
            && self.singular_values.iter().all(|x| x.is_finite())
    }
}

/// Which path produced a decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompositionPath {
    Randomized,
    ExactFallback,
}

/// Compute backend for truncated SVD.
///
/// Both methods return `None` when the decomposition does not converge.
/// `rank` is already clamped to `min(m, n)` by the caller.
pub trait LowRankSolver: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Approximate top-`rank` decomposition.
    fn randomized(&self, a: &DMatrix<f64>, rank: usize) -> Option<SvdFactors>;

    /// Full decomposition truncated to `rank`.
    fn exact(&self, a: &DMatrix<f64>, rank: usize) -> Option<SvdFactors>;
}

/// nalgebra-backed solver.
#[derive(Debug, Clone)]
pub struct NalgebraSolver {
    oversample: usize,
    power_iters: usize,
    max_iters: usize,
    exact_max_iters: usize,
    seed: u64,
}

impl NalgebraSolver {
    pub fn new(config: &SvdConfig) -> Self {
        Self {
            oversample: config.oversample,
            power_iters: config.power_iters,
            max_iters: config.max_iters,
            exact_max_iters: config.exact_max_iters,
            seed: config.seed,
        }
    }

    fn gaussian(&self, rows: usize, cols: usize) -> DMatrix<f64> {
        // Seed depends on the shape so same-shaped calls are reproducible.
        let mixed = self.seed ^ ((rows as u64) << 32) ^ cols as u64;
        let mut rng = StdRng::seed_from_u64(mixed);
        DMatrix::from_fn(rows, cols, |_, _| rng.sample::<f64, _>(StandardNormal))
    }
}

impl Default for NalgebraSolver {
    fn default() -> Self {
        Self::new(&SvdConfig::default())
    }
}

impl LowRankSolver for NalgebraSolver {
    fn name(&self) -> &'static str {
        "nalgebra"
    }

    fn randomized(&self, a: &DMatrix<f64>, rank: usize) -> Option<SvdFactors> {
        let (m, n) = a.shape();
        let k = rank.min(m).min(n);
        if k == 0 {
            return None;
        }
        let sketch = (k + self.oversample).min(n);

        // Range finder: Q spans the dominant column space of A
        let omega = self.gaussian(n, sketch);
        let mut q = (a * &omega).qr().q();
        for _ in 0..self.power_iters {
            let z = (a.transpose() * &q).qr().q();
            q = (a * &z).qr().q();
        }

        // B = Qᵀ A is small (sketch × n); decompose it exactly
        let b = q.transpose() * a;
        let svd = b.try_svd(true, true, f64::EPSILON, self.max_iters)?;
        let u_b = svd.u?;
        let v_t = svd.v_t?;
        let u = q * u_b;

        let factors = truncate(&u, &svd.singular_values, &v_t, k);
        factors.is_finite().then_some(factors)
    }

    fn exact(&self, a: &DMatrix<f64>, rank: usize) -> Option<SvdFactors> {
        let (m, n) = a.shape();
        let k = rank.min(m).min(n);
        if k == 0 {
            return None;
        }
        let svd = a
            .clone()
            .try_svd(true, true, f64::EPSILON, self.exact_max_iters)?;
        let u = svd.u?;
        let v_t = svd.v_t?;
        let factors = truncate(&u, &svd.singular_values, &v_t, k);
        factors.is_finite().then_some(factors)
    }
}

/// Keep the `k` largest singular triplets, in descending order.
fn truncate(u: &DMatrix<f64>, s: &DVector<f64>, v_t: &DMatrix<f64>, k: usize) -> SvdFactors {
    let mut order: Vec<usize> = (0..s.len()).collect();
    order.sort_by(|&i, &j| s[j].total_cmp(&s[i]));
    order.truncate(k);

    SvdFactors {
        u: DMatrix::from_fn(u.nrows(), order.len(), |i, j| u[(i, order[j])]),
        singular_values: DVector::from_fn(order.len(), |j, _| s[order[j]]),
        v: DMatrix::from_fn(v_t.ncols(), order.len(), |i, j| v_t[(order[j], i)]),
    }
}

/// Randomized decomposition with exact fallback.
///
/// Non-convergence of the randomized path is reported through a tracing
/// warning and the returned [`DecompositionPath`]; only a failure of the
/// exact path is an error.
pub fn truncated_svd(
    solver: &dyn LowRankSolver,
    a: &DMatrix<f64>,
    rank: usize,
) -> Result<(SvdFactors, DecompositionPath)> {
    let (m, n) = a.shape();
    let k = rank.min(m).min(n);
    if k == 0 {
        return Err(GaloreError::Decomposition {
            rows: m,
            cols: n,
            rank,
            reason: "empty matrix".into(),
        });
    }

    if let Some(factors) = solver.randomized(a, k) {
        return Ok((factors, DecompositionPath::Randomized));
    }

    tracing::warn!(
        solver = solver.name(),
        rows = m,
        cols = n,
        rank = k,
        event = "svd_fallback",
        "Randomized SVD did not converge, falling back to exact decomposition"
    );

    match solver.exact(a, k) {
        Some(factors) => Ok((factors, DecompositionPath::ExactFallback)),
        None => Err(GaloreError::Decomposition {
            rows: m,
            cols: n,
            rank: k,
            reason: format!("{} exact SVD did not converge", solver.name()),
        }),
    }
}

/// Copy a 2-D tensor into an f64 nalgebra matrix.
pub fn tensor_to_matrix(t: &Tensor) -> Result<DMatrix<f64>> {
    let (rows, cols) = t.dims2()?;
    let data = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok(DMatrix::from_row_slice(rows, cols, &data))
}

/// Copy an nalgebra matrix into an F32 tensor on `device`.
pub fn matrix_to_tensor(mat: &DMatrix<f64>, device: &Device) -> Result<Tensor> {
    let (rows, cols) = mat.shape();
    let data: Vec<f32> = (0..rows)
        .flat_map(|i| (0..cols).map(move |j| mat[(i, j)] as f32))
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Solver whose randomized path never converges.
    #[derive(Debug)]
    struct NoRandomized(NalgebraSolver);

    impl LowRankSolver for NoRandomized {
        fn name(&self) -> &'static str {
            "no-randomized"
        }
        fn randomized(&self, _a: &DMatrix<f64>, _rank: usize) -> Option<SvdFactors> {
            None
        }
        fn exact(&self, a: &DMatrix<f64>, rank: usize) -> Option<SvdFactors> {
            self.0.exact(a, rank)
        }
    }

    #[derive(Debug)]
    struct NeverConverges;

    impl LowRankSolver for NeverConverges {
        fn name(&self) -> &'static str {
            "never"
        }
        fn randomized(&self, _a: &DMatrix<f64>, _rank: usize) -> Option<SvdFactors> {
            None
        }
        fn exact(&self, _a: &DMatrix<f64>, _rank: usize) -> Option<SvdFactors> {
            None
        }
    }

    fn test_matrix(m: usize, n: usize) -> DMatrix<f64> {
        DMatrix::from_fn(m, n, |i, j| ((i * 7 + j * 3) % 11) as f64 - 5.0 + (i == j) as u8 as f64)
    }

    fn max_orthonormality_error(q: &DMatrix<f64>) -> f64 {
        let qtq = q.transpose() * q;
        let eye = DMatrix::<f64>::identity(qtq.nrows(), qtq.ncols());
        (qtq - eye).amax()
    }

    #[test]
    fn test_randomized_matches_exact_subspace() {
        let a = test_matrix(12, 9);
        let solver = NalgebraSolver::default();
        let fast = solver.randomized(&a, 3).unwrap();
        let exact = solver.exact(&a, 3).unwrap();

        assert_eq!(fast.u.shape(), (12, 3));
        assert_eq!(fast.v.shape(), (9, 3));
        for i in 0..3 {
            let rel = (fast.singular_values[i] - exact.singular_values[i]).abs()
                / exact.singular_values[i].max(1e-12);
            assert!(rel < 1e-6, "singular value {} differs: {}", i, rel);
        }
        assert!(max_orthonormality_error(&fast.u) < 1e-9);
        assert!(max_orthonormality_error(&fast.v) < 1e-9);
    }

    #[test]
    fn test_singular_values_descending() {
        let a = test_matrix(6, 10);
        let f = NalgebraSolver::default().exact(&a, 6).unwrap();
        for w in f.singular_values.as_slice().windows(2) {
            assert!(w[0] >= w[1]);
        }
    }

    #[test]
    fn test_rank_clamped_to_min_dim() {
        let a = test_matrix(4, 7);
        let (f, _) = truncated_svd(&NalgebraSolver::default(), &a, 50).unwrap();
        assert_eq!(f.rank(), 4);
        assert_eq!(f.u.shape(), (4, 4));
        assert_eq!(f.v.shape(), (7, 4));
    }

    #[test]
    fn test_fallback_reports_exact_path() {
        let a = test_matrix(5, 5);
        let solver = NoRandomized(NalgebraSolver::default());
        let (f, path) = truncated_svd(&solver, &a, 2).unwrap();
        assert_eq!(path, DecompositionPath::ExactFallback);
        assert_eq!(f.rank(), 2);
    }

    #[test]
    fn test_exact_failure_is_fatal() {
        let a = test_matrix(5, 5);
        let err = truncated_svd(&NeverConverges, &a, 2).unwrap_err();
        assert!(matches!(err, GaloreError::Decomposition { rank: 2, .. }));
    }

    #[test]
    fn test_tensor_matrix_roundtrip() -> Result<()> {
        let t = Tensor::new(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &Device::Cpu)?;
        let m = tensor_to_matrix(&t)?;
        assert_eq!(m[(1, 0)], 4.0);
        assert_eq!(m[(0, 2)], 3.0);
        let back = matrix_to_tensor(&m, &Device::Cpu)?;
        assert_eq!(back.to_vec2::<f32>()?, t.to_vec2::<f32>()?);
        Ok(())
    }
}
