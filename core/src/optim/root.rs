//! Inverse p-th roots of symmetric positive semi-definite matrices.
//!
//! The primary path is the coupled Newton iteration of Guo and Higham; it only
//! needs matrix products. When it does not reach `fallback_threshold`, runs
//! out of budget, or produces non-finite values, the root is recomputed from a
//! Jacobi eigendecomposition. Callers never see which path was taken.

use crate::config::OptimizerConfig;
use crate::error::Result;
use crate::tensor::{Tensor, TensorError};
use revlm_kernels::cpu_eigh;
use tracing::debug;

const POWER_ITERATIONS: usize = 100;
const EIGH_SWEEPS: usize = 64;
const EIGH_TOLERANCE: f64 = 1e-14;
/// A step that grows the residual by more than this factor ends the iteration.
const DIVERGENCE_FACTOR: f64 = 1.2;

/// Settings for [`inverse_pth_root`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootConfig {
    pub iterations: usize,
    pub ridge_epsilon: f64,
    pub error_tolerance: f64,
    pub fallback_threshold: f64,
}

impl RootConfig {
    pub fn from_optimizer(config: &OptimizerConfig) -> Self {
        Self {
            iterations: config.root_iterations,
            ridge_epsilon: config.root_ridge_epsilon,
            error_tolerance: config.root_error_tolerance,
            fallback_threshold: config.root_fallback_threshold,
        }
    }
}

/// `(A + ridge * I)^(-1/p)` for a symmetric `[n, n]` matrix `A`.
///
/// The ridge is `ridge_epsilon` times the largest eigenvalue of `A`.
pub fn inverse_pth_root(matrix: &Tensor<f64>, p: usize, config: &RootConfig) -> Result<Tensor<f64>> {
    let n = square_size(matrix)?;
    let max_ev = power_iteration(matrix, n)?;
    let ridge = config.ridge_epsilon * max_ev.max(1e-16);
    let damped = (matrix + &Tensor::eye(n).scale(ridge))?;

    if let Some(root) = coupled_newton(&damped, n, p, max_ev + ridge, config)? {
        return Ok(root);
    }
    debug!(n, p, "inverse root falling back to eigendecomposition");
    eigh_root(&damped, n, p, ridge)
}

fn square_size(matrix: &Tensor<f64>) -> Result<usize> {
    match *matrix.shape() {
        [rows, cols] if rows == cols => Ok(rows),
        _ => Err(TensorError::ShapeMismatch {
            expected: vec![matrix.shape().first().copied().unwrap_or(0); 2],
            got: matrix.shape().to_vec(),
        }
        .into()),
    }
}

/// Largest eigenvalue of a PSD matrix.
fn power_iteration(matrix: &Tensor<f64>, n: usize) -> Result<f64> {
    let mut v = Tensor::full(&[n, 1], 1.0 / (n as f64).sqrt());
    let mut eigenvalue = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let w = matrix.matmul(&v)?;
        let norm = w.sum_squares().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Ok(norm);
        }
        eigenvalue = norm;
        v = w.scale(1.0 / norm);
    }
    Ok(eigenvalue)
}

fn max_abs_diff_from_identity(m: &Tensor<f64>, n: usize) -> f64 {
    m.data()
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let target = if i / n == i % n { 1.0 } else { 0.0 };
            (x - target).abs()
        })
        .fold(0.0, f64::max)
}

fn matrix_power(m: &Tensor<f64>, n: usize, mut p: usize) -> Result<Tensor<f64>> {
    let mut result = Tensor::eye(n);
    let mut base = m.clone();
    while p > 0 {
        if p & 1 == 1 {
            result = result.matmul(&base)?;
        }
        p >>= 1;
        if p > 0 {
            base = base.matmul(&base)?;
        }
    }
    Ok(result)
}

/// Returns `None` when the iteration did not get within `fallback_threshold`.
fn coupled_newton(
    damped: &Tensor<f64>,
    n: usize,
    p: usize,
    max_ev: f64,
    config: &RootConfig,
) -> Result<Option<Tensor<f64>>> {
    if config.iterations == 0 {
        return Ok(None);
    }
    let alpha = -1.0 / p as f64;
    let identity = Tensor::<f64>::eye(n);
    let z = (1.0 + p as f64) / (2.0 * max_ev.max(1e-16));

    let mut m = damped.scale(z);
    let mut h = identity.scale(z.powf(1.0 / p as f64));
    let mut error = max_abs_diff_from_identity(&m, n);

    for _ in 0..config.iterations {
        if error <= config.error_tolerance {
            break;
        }
        let step = (&identity.scale(1.0 - alpha) + &m.scale(alpha))?;
        let next_m = matrix_power(&step, n, p)?.matmul(&m)?;
        let next_h = h.matmul(&step)?;
        let next_error = max_abs_diff_from_identity(&next_m, n);
        if !next_error.is_finite() || next_error > error * DIVERGENCE_FACTOR {
            break;
        }
        m = next_m;
        h = next_h;
        error = next_error;
    }

    if error > config.fallback_threshold || !h.all_finite() {
        return Ok(None);
    }
    Ok(Some(h))
}

/// `V diag(max(λ, floor)^(-1/p)) Vᵀ`.
fn eigh_root(damped: &Tensor<f64>, n: usize, p: usize, floor: f64) -> Result<Tensor<f64>> {
    let (values, vectors) = cpu_eigh(damped.data(), n, EIGH_SWEEPS, EIGH_TOLERANCE).map_err(TensorError::from)?;
    let floor = floor.max(f64::MIN_POSITIVE);
    let exponent = -1.0 / p as f64;
    let scaled: Vec<f64> = values.iter().map(|&v| v.max(floor).powf(exponent)).collect();

    let vectors = Tensor::new(vectors, vec![n, n])?;
    let weighted = Tensor::from_fn(&[n, n], |i| vectors.data()[i] * scaled[i % n]);
    Ok(weighted.matmul(&vectors.transpose()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(iterations: usize) -> RootConfig {
        RootConfig {
            iterations,
            ridge_epsilon: 0.0,
            error_tolerance: 1e-10,
            fallback_threshold: 1e-3,
        }
    }

    fn spd() -> Tensor<f64> {
        Tensor::new(vec![4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0], vec![3, 3]).unwrap()
    }

    fn assert_close(a: &Tensor<f64>, b: &Tensor<f64>, tol: f64) {
        for (x, y) in a.data().iter().zip(b.data()) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    #[test]
    fn test_diagonal_root() {
        let m = Tensor::new(vec![16.0, 0.0, 0.0, 81.0], vec![2, 2]).unwrap();
        let root = inverse_pth_root(&m, 4, &config(100)).unwrap();
        assert_close(&root, &Tensor::new(vec![0.5, 0.0, 0.0, 1.0 / 3.0], vec![2, 2]).unwrap(), 1e-6);
    }

    #[test]
    fn test_root_inverts_matrix() {
        let m = spd();
        let p = 4;
        let root = inverse_pth_root(&m, p, &config(100)).unwrap();
        let product = matrix_power(&root, 3, p).unwrap().matmul(&m).unwrap();
        assert_close(&product, &Tensor::eye(3), 1e-6);
    }

    #[test]
    fn test_fallback_matches_iteration() {
        let m = spd();
        let newton = inverse_pth_root(&m, 2, &config(100)).unwrap();
        let eigen = inverse_pth_root(&m, 2, &config(0)).unwrap();
        assert_close(&newton, &eigen, 1e-6);
    }

    #[test]
    fn test_zero_matrix_is_finite() {
        let root = inverse_pth_root(&Tensor::zeros(&[2, 2]), 2, &RootConfig {
            ridge_epsilon: 1e-6,
            ..config(100)
        })
        .unwrap();
        assert!(root.all_finite());
    }

    #[test]
    fn test_rejects_non_square() {
        assert!(inverse_pth_root(&Tensor::zeros(&[2, 3]), 2, &config(10)).is_err());
    }
}
