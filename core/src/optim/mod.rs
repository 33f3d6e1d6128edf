//! The optimizer: adaptive clipping, Adam or SM3, Shampoo, and grafting.
//!
//! Every parameter is updated on its own, in `f64`. Small parameters (norm
//! scales, vectors, stacked matrices) take the plain second-moment direction.
//! Everything else is preconditioned by Shampoo, smoothed by momentum and
//! rescaled to the norm of the second-moment direction:
//!
//! ```text
//! g ─► clip ─► adam | sm3 ───────────────────────────────┐ magnitude
//!        └───► shampoo (per slice if stacked) ─► momentum ─┴► graft ─► w += lr · u
//! ```
//!
//! Optimizer state lives in the same store as the parameters, under
//! `/optimizer:0<parameter name>/...`, so it is checkpointed with them. It is
//! created by running the same update in [`Mode::Init`], which touches no
//! weights.

use crate::config::{OptimizerConfig, SecondMoment};
use crate::context::{Context, Mode, OPTIMIZER_MARKER, ParamMeta, Scope, is_optimizer_state};
use crate::error::{Error, Result};
use crate::tensor::{StorageDtype, Tensor, TensorError};
use std::collections::BTreeMap;
use tracing::debug;

pub mod adam;
pub mod clip;
pub mod root;
pub mod scheduler;
pub mod shampoo;

pub use adam::{Ema, adam, sm3};
pub use clip::{adaptive_gradient_clipping, graft, squared_norm};
pub use root::{RootConfig, inverse_pth_root};
pub use scheduler::{LRScheduler, WarmupExponentialDecay};
pub use shampoo::{BlockPartitioner, Preconditioner, merge_small_dims, shampoo};

/// Reads a state entry under `ctx`'s scope, creating it in init mode.
pub(crate) fn read_state(
    ctx: &Context,
    name: &str,
    owner: &ParamMeta,
    dims: &[String],
    dtype: StorageDtype,
    init: impl FnOnce() -> Tensor<f64>,
) -> Result<Tensor<f64>> {
    let full = ctx.prefixed(name);
    if let Some(value) = ctx.store().get(&full) {
        return Ok(value.cast()?);
    }
    if !ctx.is_initializing() {
        return Err(Error::UnknownParameter(full));
    }
    let value = init();
    let meta = ParamMeta::state_of(owner, dims.to_vec(), dtype);
    ctx.store_mut().insert(full, value.cast()?, meta);
    Ok(value)
}

/// Writes a state entry back; a no-op in init mode.
pub(crate) fn write_state(ctx: &Context, name: &str, value: &Tensor<f64>) -> Result<()> {
    if ctx.is_initializing() {
        return Ok(());
    }
    ctx.store_mut().set(&ctx.prefixed(name), value.cast()?)
}

/// Parameters that skip Shampoo and weight decay.
pub fn is_small(meta: &ParamMeta, rank: usize) -> bool {
    meta.small || rank < 2 + usize::from(meta.stacked)
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
    schedule: WarmupExponentialDecay,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        let schedule = WarmupExponentialDecay::from_config(&config);
        Self { config, schedule }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn learning_rate(&self, step: usize) -> f64 {
        self.schedule.get_lr(step)
    }

    /// Creates every state entry for the model parameters in `ctx`'s store.
    pub fn init_state(&self, ctx: &Context) -> Result<()> {
        if ctx.mode() != Mode::Init {
            return Err(Error::Config("optimizer state is created by an init-mode context".to_string()));
        }
        let grads: BTreeMap<String, Tensor> = {
            let store = ctx.store();
            store
                .model_names()
                .into_iter()
                .filter_map(|name| store.get(&name).map(|value| (name.clone(), Tensor::zeros(value.shape()))))
                .collect()
        };
        self.update(ctx, &grads, 0)?;
        debug!(entries = ctx.store().len(), "optimizer state initialized");
        Ok(())
    }

    /// Applies one step to every parameter in `grads`.
    ///
    /// Names containing `optimizer` are skipped. Scopes are derived from a
    /// copy of `ctx`, so repeated calls resolve the same state names.
    pub fn update(&self, ctx: &Context, grads: &BTreeMap<String, Tensor>, step: usize) -> Result<()> {
        let mut root = ctx.clone();
        let outer = root.add_to_prefix(OPTIMIZER_MARKER);
        let lr = -self.schedule.get_lr(step);
        for (name, grad) in grads {
            if is_optimizer_state(name) {
                continue;
            }
            let mut param_ctx = outer.with_scope(Scope::at(format!("{}{}", outer.prefix(), name)));
            self.update_parameter(&mut param_ctx, name, grad, lr, step)?;
        }
        if !ctx.is_initializing() {
            debug!(step, lr = -lr, parameters = grads.len(), "optimizer step");
        }
        Ok(())
    }

    fn update_parameter(&self, ctx: &mut Context, name: &str, grad: &Tensor, lr: f64, step: usize) -> Result<()> {
        let (weight, meta) = {
            let store = ctx.store();
            match (store.get(name), store.meta(name)) {
                (Some(weight), Some(meta)) => (weight.cast::<f64>()?, meta.clone()),
                _ => return Err(Error::UnknownParameter(name.to_string())),
            }
        };
        if grad.shape() != weight.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: weight.shape().to_vec(),
                got: grad.shape().to_vec(),
            }
            .into());
        }
        let config = &self.config;
        let grad = grad.cast::<f64>()?;
        let param_lr = lr * meta.variance;
        let small = is_small(&meta, grad.rank());
        let dtype = if config.quantize_state && !small {
            StorageDtype::Bf16
        } else {
            StorageDtype::F32
        };

        let grad = adaptive_gradient_clipping(&grad, &weight, meta.stacked, config.gradient_clip, config.epsilon)?;
        let mut update = match config.second_moment {
            SecondMoment::Adam => adam(ctx, &meta, &grad, step, config, dtype)?,
            SecondMoment::Sm3 => sm3(ctx, &meta, &grad, config.epsilon)?,
        };

        let mut weight = weight;
        if !small {
            let direction = if meta.stacked {
                let slices = (0..grad.shape()[0])
                    .map(|i| shampoo(ctx, &meta, &grad.index_axis(0, i)?, step, config))
                    .collect::<Result<Vec<_>>>()?;
                Tensor::stack(&slices, 0)?
            } else {
                shampoo(ctx, &meta, &grad, step, config)?
            };
            let direction = Ema {
                beta: config.momentum_beta,
                heavyball: config.heavyball,
                nesterov: config.nesterov,
                dtype,
            }
            .update(ctx, &meta, &meta.dims, &direction, step, || Tensor::zeros(grad.shape()))?;
            update = graft(&update, &direction, meta.stacked)?;
            weight = weight.scale(1.0 + config.weight_decay * param_lr);
        }

        if ctx.is_initializing() {
            return Ok(());
        }
        let weight = (&weight + &update.scale(param_lr))?;
        ctx.store_mut().set(name, weight.cast()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::ParamStore;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn meta(dims: &[&str], small: bool, stacked: bool) -> ParamMeta {
        ParamMeta {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            variance: 1.0,
            stacked,
            small,
            shard_axis: None,
            dtype: StorageDtype::F32,
        }
    }

    fn setup(params: Vec<(&str, Tensor, ParamMeta)>) -> (Optimizer, Context) {
        let mut config = Config::default();
        config.optimizer.warmup_end = 1;
        config.optimizer.statistics_compute_steps = 1;
        let mut store = ParamStore::new();
        for (name, value, meta) in params {
            store.insert(name, value, meta);
        }
        let store = Rc::new(RefCell::new(store));
        let config = Rc::new(config);
        let optimizer = Optimizer::new(config.optimizer.clone());
        let init = Context::with_store(Rc::clone(&config), Rc::clone(&store), Mode::Init);
        optimizer.init_state(&init).unwrap();
        (optimizer, Context::with_store(config, store, Mode::Compute))
    }

    /// Size of Adam's de-biased first step at `step` for a nonzero gradient.
    fn first_adam_magnitude(config: &OptimizerConfig, step: i32) -> f64 {
        let m = (1.0 - config.adam_beta1) / (1.0 - config.adam_beta1.powi(step + 1));
        let v = (1.0 - config.adam_beta2) / (1.0 - config.adam_beta2.powi(step + 1));
        m / v.sqrt()
    }

    fn grads(entries: &[(&str, Tensor)]) -> BTreeMap<String, Tensor> {
        entries.iter().map(|(n, g)| (n.to_string(), g.clone())).collect()
    }

    #[test]
    fn test_init_creates_state_without_moving_weights() {
        let w = Tensor::from_fn(&[4, 3], |i| i as f32 * 0.1);
        let (_, ctx) = setup(vec![("/w", w.clone(), meta(&["heads", "intermediate"], false, false))]);
        let store = ctx.store();
        assert_eq!(store.get("/w"), Some(&w));
        for name in [
            "/optimizer:0/w/adam:0/ema:0/momentum_buffer",
            "/optimizer:0/w/adam:0/ema:1/momentum_buffer",
            "/optimizer:0/w/shampoo:0/ema:0/momentum_buffer",
            "/optimizer:0/w/shampoo:0/preconditioner_0",
            "/optimizer:0/w/ema:0/momentum_buffer",
        ] {
            assert!(store.contains(name), "missing {name}");
        }
        assert_eq!(store.get("/optimizer:0/w/shampoo:0/preconditioner_0").unwrap().shape(), &[12, 12]);
        assert_eq!(store.model_names(), vec!["/w".to_string()]);
    }

    #[test]
    fn test_small_parameter_takes_adam_step() {
        let w = Tensor::new(vec![1.0, -1.0], vec![2]).unwrap();
        let (optimizer, ctx) = setup(vec![("/scale", w, meta(&["heads"], true, false))]);
        let g = Tensor::new(vec![0.5, -0.5], vec![2]).unwrap();
        optimizer.update(&ctx, &grads(&[("/scale", g)]), 1).unwrap();
        let expected = 1.0 - optimizer.learning_rate(1) * first_adam_magnitude(optimizer.config(), 1);
        let updated = ctx.store().get("/scale").cloned().unwrap();
        assert!((updated.data()[0] as f64 - expected).abs() < 1e-6);
        assert!((updated.data()[1] as f64 + expected).abs() < 1e-6);
        assert!(!ctx.store().contains("/optimizer:0/scale/shampoo:0/preconditioner_0"));
    }

    #[test]
    fn test_grafted_step_has_adam_norm() {
        let w = Tensor::from_fn(&[4, 3], |i| (i as f32 - 5.5) * 0.1);
        let (optimizer, ctx) = setup(vec![("/w", w.clone(), meta(&["heads", "intermediate"], false, false))]);
        let g = Tensor::from_fn(&[4, 3], |i| if i % 2 == 0 { 0.3 } else { -0.2 } * (i as f32 + 1.0));
        optimizer.update(&ctx, &grads(&[("/w", g)]), 1).unwrap();

        let lr = optimizer.learning_rate(1);
        let decayed = w
            .cast::<f64>()
            .unwrap()
            .scale(1.0 - optimizer.config().weight_decay * lr);
        let updated = ctx.store().get("/w").unwrap().cast::<f64>().unwrap();
        let step = (&updated - &decayed).unwrap();
        // Every Adam entry has the same magnitude, so the grafted norm is known.
        let expected = lr * first_adam_magnitude(optimizer.config(), 1) * 12f64.sqrt();
        assert!((step.sum_squares().sqrt() - expected).abs() < 1e-5);
    }

    #[test]
    fn test_stacked_parameters_are_preconditioned_per_slice() {
        let w = Tensor::from_fn(&[2, 3, 2], |i| i as f32 * 0.05 + 0.1);
        let (optimizer, ctx) = setup(vec![("/e", w, meta(&["experts", "heads", "features_per_head"], false, true))]);
        assert!(ctx.store().contains("/optimizer:0/e/shampoo:0/preconditioner_0"));
        assert!(ctx.store().contains("/optimizer:0/e/shampoo:1/preconditioner_0"));
        let g = Tensor::from_fn(&[2, 3, 2], |i| (i as f32).sin());
        optimizer.update(&ctx, &grads(&[("/e", g)]), 1).unwrap();
        assert!(ctx.store().get("/e").unwrap().all_finite());
    }

    #[test]
    fn test_optimizer_names_are_skipped() {
        let w = Tensor::new(vec![1.0], vec![1]).unwrap();
        let (optimizer, ctx) = setup(vec![("/scale", w, meta(&["one"], true, false))]);
        let name = "/optimizer:0/scale/adam:0/ema:0/momentum_buffer";
        let before = ctx.store().get(name).cloned();
        let g = Tensor::new(vec![1.0], vec![1]).unwrap();
        optimizer.update(&ctx, &grads(&[(name, g)]), 1).unwrap();
        assert_eq!(ctx.store().get(name).cloned(), before);
    }

    #[test]
    fn test_unknown_parameter() {
        let (optimizer, ctx) = setup(vec![]);
        let g = Tensor::new(vec![1.0], vec![1]).unwrap();
        let err = optimizer.update(&ctx, &grads(&[("/missing", g)]), 1);
        assert!(matches!(err, Err(Error::UnknownParameter(_))));
    }

    #[test]
    fn test_sm3_branch() {
        let mut config = Config::default();
        config.optimizer.second_moment = SecondMoment::Sm3;
        let optimizer = Optimizer::new(config.optimizer.clone());
        let init = Context::new(config, Mode::Init);
        init.store_mut()
            .insert("/w", Tensor::ones(&[2, 2]), meta(&["heads", "heads"], true, false));
        optimizer.init_state(&init).unwrap();
        assert!(init.store().contains("/optimizer:0/w/sm3:0/dim1"));
        assert!(!init.store().contains("/optimizer:0/w/adam:0/ema:0/momentum_buffer"));
    }
}
