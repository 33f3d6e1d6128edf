//! The reversible language model.
//!
//! ```text
//! tokens ─► input_embed ─► (x, 0, x, 0) ─► [reversible blocks × depth] ─► revnet_out ─► output_embed ─► loss
//! ```
//!
//! Only the two ends of the graph live on the autograd tape. The blocks in
//! between run tape-free and are differentiated by
//! [`ReversibleStack::backward`], which rebuilds every block's input from its
//! output instead of keeping activations around.

use crate::autograd::Variable;
use crate::context::{Context, Mode};
use crate::error::{Error, Result};
use crate::reversible::{
    MomentumMain, MomentumSide, RevState, ReversibleStack, SubComputation, accumulate_grads, revnet_out,
    revnet_out_grad,
};
use crate::tensor::Tensor;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::debug;

pub mod embed;
pub mod layers;
pub mod loss;

pub use embed::{input_embed, output_embed, position_embedding};
pub use layers::Block;
pub use loss::{LossOutput, language_model_loss};

/// One batch of token ids, inputs and next-token targets both `[batch, sequence]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    pub inputs: Vec<usize>,
    pub targets: Vec<usize>,
    pub batch: usize,
    pub sequence: usize,
}

impl TokenBatch {
    /// Splits `[batch, sequence + 1]` windows into shifted inputs and targets.
    pub fn from_windows(windows: &[usize], batch: usize, sequence: usize) -> Result<Self> {
        if windows.len() != batch * (sequence + 1) {
            return Err(Error::Data(format!(
                "expected {} tokens for {batch} windows of {}, got {}",
                batch * (sequence + 1),
                sequence + 1,
                windows.len()
            )));
        }
        let mut inputs = Vec::with_capacity(batch * sequence);
        let mut targets = Vec::with_capacity(batch * sequence);
        for window in windows.chunks(sequence + 1) {
            inputs.extend_from_slice(&window[..sequence]);
            targets.extend_from_slice(&window[1..]);
        }
        Ok(Self {
            inputs,
            targets,
            batch,
            sequence,
        })
    }
}

/// Losses, accuracy and the gradient of `top_loss` for every model parameter.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub top_loss: f32,
    pub loss: f32,
    pub accuracy: f32,
    pub grads: BTreeMap<String, Tensor>,
}

/// Residual branches of layer `depth`, wrapped as a momentum network if configured.
fn layer_blocks(ctx: &Context) -> Vec<Rc<dyn SubComputation>> {
    let model = &ctx.config().model;
    let mut blocks: Vec<Rc<dyn SubComputation>> = Vec::new();
    for &kind in &model.blocks {
        if model.momentumnet {
            blocks.push(Rc::new(MomentumMain {
                inner: Block(kind),
                beta: model.momentumnet_beta,
            }));
            blocks.push(Rc::new(MomentumSide {
                beta: model.momentumnet_beta,
            }));
        } else {
            blocks.push(Rc::new(Block(kind)));
        }
    }
    blocks
}

/// Runs the embedding and every reversible block.
fn body(ctx: &mut Context, batch: &TokenBatch, stack: &mut ReversibleStack) -> Result<(Variable, RevState)> {
    let embedded = input_embed(ctx, &batch.inputs, batch.batch, batch.sequence)?;
    let mut state = RevState::from_input(embedded.data().clone());
    let blocks = layer_blocks(ctx);
    for depth in 0..ctx.config().model.depth {
        for block in &blocks {
            state = stack.apply(ctx, Rc::clone(block), depth, state)?;
        }
    }
    Ok((embedded, state))
}

/// Init pass: creates every model parameter in the context's store.
pub fn init_params(ctx: &mut Context, batch: &TokenBatch) -> Result<()> {
    if ctx.mode() != Mode::Init {
        return Err(Error::Config("init_params needs an init-mode context".to_string()));
    }
    let mut stack = ReversibleStack::new();
    let (_, state) = body(ctx, batch, &mut stack)?;
    output_embed(ctx, &Variable::constant(state.x1))?;
    debug!(parameters = ctx.store().len(), "model initialized");
    Ok(())
}

/// Forward and backward pass over one batch.
///
/// The returned gradient map has exactly one entry per model parameter;
/// parameters the batch did not reach get zeros.
pub fn compute(ctx: &mut Context, batch: &TokenBatch) -> Result<StepOutput> {
    if ctx.mode() != Mode::Compute {
        return Err(Error::Config("compute needs a compute-mode context".to_string()));
    }
    let mut stack = ReversibleStack::new();
    let (embedded, state) = body(ctx, batch, &mut stack)?;

    let rails = Variable::leaf(revnet_out(&state)?);
    let logits = output_embed(ctx, &rails)?;
    let out = language_model_loss(&logits, &batch.targets, &ctx.config().model)?;
    out.top_loss.backward()?;

    let d_rails = rails
        .grad()
        .unwrap_or_else(|| Tensor::zeros(rails.data().shape()));
    let back = stack.backward(ctx, revnet_out_grad(&state, &d_rails))?;
    embedded.backward_with((&back.dy0 + &back.dy1)?)?;

    let mut grads = ctx.take_param_grads();
    accumulate_grads(&mut grads, back.d_params)?;
    for name in ctx.store().model_names() {
        if !grads.contains_key(&name) {
            let shape = ctx
                .store()
                .get(&name)
                .map(|t| t.shape().to_vec())
                .unwrap_or_default();
            grads.insert(name, Tensor::zeros(&shape));
        }
    }

    let top_loss = out.top_loss.data().item()?;
    Ok(StepOutput {
        top_loss,
        loss: out.loss,
        accuracy: out.accuracy,
        grads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockKind, Config};

    fn tiny_config() -> Config {
        let mut config = Config::default();
        config.data.vocab_size = 4;
        config.dims.batch = 2;
        config.dims.sequence = 4;
        config.dims.heads = 2;
        config.dims.features_per_head = 2;
        config.dims.intermediate = 4;
        config.model.depth = 2;
        config.model.blocks = vec![BlockKind::Attention, BlockKind::FeedForward];
        config
    }

    fn batch() -> TokenBatch {
        TokenBatch::from_windows(&[0, 1, 2, 3, 0, 3, 2, 1, 0, 1], 2, 4).unwrap()
    }

    #[test]
    fn test_windows_split_into_shifted_pairs() {
        let b = batch();
        assert_eq!(b.inputs, vec![0, 1, 2, 3, 3, 2, 1, 0]);
        assert_eq!(b.targets, vec![1, 2, 3, 0, 2, 1, 0, 1]);
        assert!(TokenBatch::from_windows(&[0, 1], 2, 4).is_err());
    }

    #[test]
    fn test_fresh_model_predicts_uniformly() {
        let mut init = Context::new(tiny_config(), Mode::Init);
        init_params(&mut init, &batch()).unwrap();
        let mut ctx = Context::with_store(init.config_rc(), init.store_rc(), Mode::Compute);
        let out = compute(&mut ctx, &batch()).unwrap();
        // The output projection starts at zero.
        assert!((out.loss - 4f32.ln()).abs() < 1e-5);
        let names = ctx.store().model_names();
        assert_eq!(out.grads.keys().cloned().collect::<Vec<_>>(), names);
    }

    #[test]
    fn test_modes_are_checked() {
        let mut init = Context::new(tiny_config(), Mode::Init);
        assert!(compute(&mut init, &batch()).is_err());
        let mut ctx = Context::new(tiny_config(), Mode::Compute);
        assert!(init_params(&mut ctx, &batch()).is_err());
    }
}
