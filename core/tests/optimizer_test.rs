use proptest::prelude::*;
use revlm::config::OptimizerConfig;
use revlm::optim::{RootConfig, adaptive_gradient_clipping, inverse_pth_root, squared_norm};
use revlm::tensor::Tensor;

/// Symmetric positive definite matrix `G G^T + 0.5 I`.
fn spd(n: usize, seed: usize) -> Tensor<f64> {
    let g = Tensor::<f64>::from_fn(&[n, n], |i| (((i + seed) * 7919) % 101) as f64 / 101.0 - 0.5);
    let gram = g.matmul(&g.transpose().unwrap()).unwrap();
    (&gram + &Tensor::<f64>::eye(n).scale(0.5)).unwrap()
}

fn power(matrix: &Tensor<f64>, p: usize) -> Tensor<f64> {
    let n = matrix.shape()[0];
    (0..p).fold(Tensor::eye(n), |acc, _| acc.matmul(matrix).unwrap())
}

fn max_abs_diff(a: &Tensor<f64>, b: &Tensor<f64>) -> f64 {
    a.data()
        .iter()
        .zip(b.data())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

#[test]
fn test_root_to_the_power_inverts_statistic() {
    let config = RootConfig::from_optimizer(&OptimizerConfig::default());
    for (n, p) in [(4, 2), (6, 4), (8, 8)] {
        let a = spd(n, n);
        let root = inverse_pth_root(&a, p, &config).unwrap();
        let product = power(&root, p).matmul(&a).unwrap();
        assert!(max_abs_diff(&product, &Tensor::eye(n)) < 1e-3, "n={n} p={p}");
    }
}

#[test]
fn test_eigh_fallback_matches_iteration() {
    let iterative = RootConfig::from_optimizer(&OptimizerConfig::default());
    let fallback = RootConfig {
        iterations: 0,
        ..iterative
    };
    let a = spd(5, 3);
    let primary = inverse_pth_root(&a, 4, &iterative).unwrap();
    let exact = inverse_pth_root(&a, 4, &fallback).unwrap();
    assert!(max_abs_diff(&primary, &exact) < 1e-5);
}

#[test]
fn test_ill_conditioned_root_stays_finite() {
    let config = RootConfig::from_optimizer(&OptimizerConfig::default());
    let mut a = Tensor::<f64>::zeros(&[3, 3]);
    a.data_mut()[0] = 1e12;
    a.data_mut()[4] = 1.0;
    let root = inverse_pth_root(&a, 4, &config).unwrap();
    assert!(root.all_finite());
}

fn norms(t: &Tensor<f64>, stacked: bool) -> Vec<f64> {
    squared_norm(t, stacked).unwrap().data().iter().map(|n| n.sqrt()).collect()
}

proptest! {
    #[test]
    fn prop_clipped_gradient_respects_bound(
        grad in prop::collection::vec(-1e3f64..1e3, 12),
        weight in prop::collection::vec(-10f64..10.0, 12),
        clip in 1e-4f64..1.0,
        stacked in any::<bool>(),
    ) {
        let g = Tensor::new(grad, vec![3, 4]).unwrap();
        let w = Tensor::new(weight, vec![3, 4]).unwrap();
        let clipped = adaptive_gradient_clipping(&g, &w, stacked, clip, 1e-16).unwrap();

        for (c, w) in norms(&clipped, stacked).into_iter().zip(norms(&w, stacked)) {
            prop_assert!(c <= clip * w.max(1e-3) * (1.0 + 1e-9) + 1e-12);
        }
        // Clipping only ever shrinks.
        for (c, g) in norms(&clipped, stacked).into_iter().zip(norms(&g, stacked)) {
            prop_assert!(c <= g * (1.0 + 1e-12));
        }
    }
}
