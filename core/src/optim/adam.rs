//! First- and second-moment estimators.

use super::{read_state, write_state};
use crate::config::OptimizerConfig;
use crate::config::dims::ONE;
use crate::context::{Context, ParamMeta};
use crate::error::Result;
use crate::tensor::{StorageDtype, Tensor};

const MOMENTUM_BUFFER: &str = "momentum_buffer";

/// Exponential moving average kept in a `momentum_buffer` state entry.
///
/// $$
/// s_t = \beta s_{t-1} + (1 - \beta) x_t
/// $$
///
/// `heavyball` feeds the input in unscaled and skips de-biasing; `nesterov`
/// returns the look-ahead `β s_t + x_t` instead of `s_t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ema {
    pub beta: f64,
    pub heavyball: bool,
    pub nesterov: bool,
    pub dtype: StorageDtype,
}

impl Ema {
    /// Folds `input` into the buffer under a fresh `ema:i` scope.
    ///
    /// `init` provides the buffer's value the first time it is seen in init mode.
    pub fn update(
        &self,
        ctx: &mut Context,
        owner: &ParamMeta,
        dims: &[String],
        input: &Tensor<f64>,
        step: usize,
        init: impl FnOnce() -> Tensor<f64>,
    ) -> Result<Tensor<f64>> {
        let ctx = ctx.add_to_prefix("ema");
        let state = read_state(&ctx, MOMENTUM_BUFFER, owner, dims, self.dtype, init)?;

        let beta = self.beta;
        let input_weight = if self.heavyball { 1.0 } else { 1.0 - beta };
        let new_state = state.zip_with(input, move |s, x| s * beta + x * input_weight)?;
        write_state(&ctx, MOMENTUM_BUFFER, &new_state)?;

        let mut out = if self.nesterov {
            new_state.zip_with(input, move |s, x| s * beta + x)?
        } else {
            new_state
        };
        if !self.heavyball {
            let correction = 1.0 - beta.powf(step as f64 + 1.0);
            out = out.scale(1.0 / correction);
        }
        Ok(out)
    }
}

/// Adam direction `m / sqrt(max(v, eps))` with de-biased moments.
pub fn adam(
    ctx: &mut Context,
    owner: &ParamMeta,
    grad: &Tensor<f64>,
    step: usize,
    config: &OptimizerConfig,
    dtype: StorageDtype,
) -> Result<Tensor<f64>> {
    let mut ctx = ctx.add_to_prefix("adam");
    let zeros = || Tensor::zeros(grad.shape());

    let first = Ema {
        beta: config.adam_beta1,
        heavyball: config.heavyball,
        nesterov: config.nesterov,
        dtype,
    }
    .update(&mut ctx, owner, &owner.dims, grad, step, zeros)?;

    let squared = grad.map(|g| g * g);
    let second = Ema {
        beta: config.adam_beta2,
        heavyball: false,
        nesterov: false,
        dtype,
    }
    .update(&mut ctx, owner, &owner.dims, &squared, step, zeros)?;

    let eps = config.epsilon;
    Ok(first.zip_with(&second, move |m, v| m / v.max(eps).sqrt())?)
}

/// SM3 direction: one accumulator per axis, covering the squared gradient
/// sum with `O(sum of dims)` memory.
pub fn sm3(ctx: &mut Context, owner: &ParamMeta, grad: &Tensor<f64>, epsilon: f64) -> Result<Tensor<f64>> {
    let ctx = ctx.add_to_prefix("sm3");
    let shape = grad.shape().to_vec();
    let rank = shape.len();

    let mut cover = if rank == 0 {
        Tensor::zeros(&shape)
    } else {
        Tensor::full(&shape, f64::INFINITY)
    };
    for axis in 0..rank {
        let mut acc_shape = vec![1; rank];
        acc_shape[axis] = shape[axis];
        let dims: Vec<String> = (0..rank)
            .map(|d| match owner.dims.get(d) {
                Some(dim) if d == axis => dim.clone(),
                _ => ONE.to_string(),
            })
            .collect();
        let acc = read_state(&ctx, &format!("dim{axis}"), owner, &dims, StorageDtype::F32, || {
            Tensor::zeros(&acc_shape)
        })?;
        cover = cover.zip_with(&acc, f64::min)?;
    }

    let updated = cover.zip_with(grad, |c, g| c + g * g)?;
    for axis in 0..rank {
        let mut reduced = updated.clone();
        for other in (0..rank).filter(|&d| d != axis) {
            reduced = reduced.max_axis_keepdim(other)?;
        }
        write_state(&ctx, &format!("dim{axis}"), &reduced)?;
    }
    Ok(grad.zip_with(&updated, move |g, v| g / v.max(epsilon).sqrt())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::{Mode, Scope};

    fn owner() -> ParamMeta {
        ParamMeta {
            dims: vec!["heads".into(), "features_per_head".into()],
            variance: 1.0,
            stacked: false,
            small: false,
            shard_axis: Some(0),
            dtype: StorageDtype::F32,
        }
    }

    fn contexts() -> (Context, Context) {
        let init = Context::new(Config::default(), Mode::Init).with_scope(Scope::at("/optimizer:0/w"));
        let compute =
            Context::with_store(init.config_rc(), init.store_rc(), Mode::Compute).with_scope(Scope::at("/optimizer:0/w"));
        (init, compute)
    }

    fn t(data: &[f64], shape: &[usize]) -> Tensor<f64> {
        Tensor::new(data.to_vec(), shape.to_vec()).unwrap()
    }

    #[test]
    fn test_ema_debiases_first_step() {
        let (mut init, mut ctx) = contexts();
        let ema = Ema {
            beta: 0.9,
            heavyball: false,
            nesterov: false,
            dtype: StorageDtype::F32,
        };
        let x = t(&[2.0, -4.0], &[2]);
        let dims = vec!["heads".to_string()];
        ema.update(&mut init, &owner(), &dims, &x, 0, || Tensor::zeros(&[2])).unwrap();
        assert!(init.store().contains("/optimizer:0/w/ema:0/momentum_buffer"));

        let out = ema.update(&mut ctx, &owner(), &dims, &x, 0, || Tensor::zeros(&[2])).unwrap();
        assert!((out.data()[0] - 2.0).abs() < 1e-6);
        assert!((out.data()[1] + 4.0).abs() < 1e-6);
        let stored = ctx.store().get("/optimizer:0/w/ema:0/momentum_buffer").cloned().unwrap();
        assert!((stored.data()[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_heavyball_accumulates() {
        let (mut init, ctx) = contexts();
        let ema = Ema {
            beta: 0.5,
            heavyball: true,
            nesterov: false,
            dtype: StorageDtype::F32,
        };
        let x = t(&[1.0], &[1]);
        let dims = vec![ONE.to_string()];
        ema.update(&mut init, &owner(), &dims, &x, 0, || t(&[1.0], &[1])).unwrap();
        let mut first = ctx.clone();
        assert_eq!(ema.update(&mut first, &owner(), &dims, &x, 0, || unreachable!()).unwrap().data(), &[1.5]);
        let mut second = ctx.clone();
        assert_eq!(ema.update(&mut second, &owner(), &dims, &x, 1, || unreachable!()).unwrap().data(), &[1.75]);
    }

    #[test]
    fn test_adam_first_step_is_sign() {
        let (mut init, mut ctx) = contexts();
        let config = OptimizerConfig::default();
        let g = t(&[0.5, -0.25, 3.0, -1.0], &[2, 2]);
        adam(&mut init, &owner(), &g, 0, &config, StorageDtype::F32).unwrap();
        let out = adam(&mut ctx, &owner(), &g, 0, &config, StorageDtype::F32).unwrap();
        for (o, g) in out.data().iter().zip(g.data()) {
            assert!((o - g.signum()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_missing_state_in_compute_mode() {
        let (_, mut ctx) = contexts();
        let g = t(&[1.0], &[1]);
        let err = adam(&mut ctx, &owner(), &g, 0, &OptimizerConfig::default(), StorageDtype::F32);
        assert!(matches!(err, Err(crate::error::Error::UnknownParameter(_))));
    }

    #[test]
    fn test_sm3_accumulators() {
        let (mut init, mut ctx) = contexts();
        let g = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        sm3(&mut init, &owner(), &g, 1e-16).unwrap();
        let out = sm3(&mut ctx, &owner(), &g, 1e-16).unwrap();
        // First step: accumulators are zero, so the update is g / |g|.
        for (o, g) in out.data().iter().zip(g.data()) {
            assert!((o - g.signum()).abs() < 1e-9);
        }
        let rows = ctx.store().get("/optimizer:0/w/sm3:0/dim0").cloned().unwrap();
        assert_eq!(rows.shape(), &[2, 1]);
        assert_eq!(rows.data(), &[4.0, 16.0]);
        let cols = ctx.store().get("/optimizer:0/w/sm3:0/dim1").cloned().unwrap();
        assert_eq!(cols.data(), &[9.0, 16.0]);
    }
}
