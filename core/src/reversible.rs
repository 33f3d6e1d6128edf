//! Reversible residual execution.
//!
//! Activations travel on two rails. Every block computes
//! `new_x1 = f(x1) + x0` and swaps the rails, so its input can be rebuilt from
//! its output as `x0 = y1 - f(y0)`. The forward pass therefore records no tape
//! at all; [`ReversibleStack::backward`] walks the blocks in reverse,
//! recomputing `f` under a local tape to obtain both the reconstructed input
//! and the vector-Jacobian product.
//!
//! Each rail carries a backup slot. On the way forward the backups hold the
//! values a block saw; on the way back the same slots carry the reconstructed
//! activations, which is what lets the next block down continue the walk.
//!
//! # Naming
//!
//! `f` declares its parameters through the [`Context`] it is given. A block
//! snapshots the caller's [`Scope`] when it is defined and restores that
//! snapshot before every forward and backward invocation, so recomputation
//! resolves to exactly the names the init pass created.

use crate::autograd::Variable;
use crate::context::{Context, Scope};
use crate::error::Result;
use crate::tensor::Tensor;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::trace;

/// Name of the scope every block's sub-computation runs under.
pub const REVERSIBLE_SCOPE: &str = "reversible";

/// A residual branch `f(ctx, x, block_index)`.
pub trait SubComputation {
    fn forward(&self, ctx: &mut Context, x: &Variable, index: usize) -> Result<Variable>;
}

impl<F> SubComputation for F
where
    F: Fn(&mut Context, &Variable, usize) -> Result<Variable>,
{
    fn forward(&self, ctx: &mut Context, x: &Variable, index: usize) -> Result<Variable> {
        self(ctx, x, index)
    }
}

/// Forward state threaded through the blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct RevState {
    pub x0: Tensor,
    pub x0_backup: Tensor,
    pub x1: Tensor,
    pub x1_backup: Tensor,
}

impl RevState {
    /// Both rails start at `x` with zero backups.
    pub fn from_input(x: Tensor) -> Self {
        let zero = Tensor::zeros(x.shape());
        Self {
            x0: x.clone(),
            x0_backup: zero.clone(),
            x1: x,
            x1_backup: zero,
        }
    }
}

/// Backward state: accumulated parameter gradients, the cotangent of each
/// rail, and each rail's reconstructed value.
#[derive(Debug, Clone)]
pub struct RevGrad {
    pub d_params: BTreeMap<String, Tensor>,
    pub dy0: Tensor,
    pub y0: Tensor,
    pub dy1: Tensor,
    pub y1: Tensor,
}

/// Sums `other` into `acc` by key; keys missing on either side count as zero.
pub fn accumulate_grads(acc: &mut BTreeMap<String, Tensor>, other: BTreeMap<String, Tensor>) -> Result<()> {
    for (name, grad) in other {
        match acc.get_mut(&name) {
            Some(existing) => *existing = (&*existing + &grad)?,
            None => {
                acc.insert(name, grad);
            }
        }
    }
    Ok(())
}

/// Sums the rails: `x0 + x1`.
pub fn revnet_out(state: &RevState) -> Result<Tensor> {
    Ok((&state.x0 + &state.x1)?)
}

/// Backward of [`revnet_out`]: both rails receive `dy` and carry their own
/// value as the reconstruction.
pub fn revnet_out_grad(state: &RevState, dy: &Tensor) -> RevGrad {
    RevGrad {
        d_params: BTreeMap::new(),
        dy0: dy.clone(),
        y0: state.x0.clone(),
        dy1: dy.clone(),
        y1: state.x1.clone(),
    }
}

/// One reversible block: a sub-computation plus the scope it was defined in.
#[derive(Clone)]
pub struct ReversibleBlock {
    f: Rc<dyn SubComputation>,
    index: usize,
    snapshot: Scope,
}

impl std::fmt::Debug for ReversibleBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReversibleBlock")
            .field("index", &self.index)
            .field("scope", &self.snapshot.prefix())
            .finish()
    }
}

impl ReversibleBlock {
    /// Captures the caller's current scope.
    pub fn new(ctx: &Context, f: Rc<dyn SubComputation>, index: usize) -> Self {
        Self {
            f,
            index,
            snapshot: ctx.scope().clone(),
        }
    }

    /// Runs `f` from the restored snapshot. Returns the output and the child
    /// context so the caller can take over its counters.
    fn invoke(&self, ctx: &Context, x: &Variable) -> Result<(Variable, Context)> {
        let mut base = ctx.with_scope(self.snapshot.clone());
        let mut child = base.add_to_prefix(REVERSIBLE_SCOPE);
        let out = self.f.forward(&mut child, x, self.index)?;
        base.adopt_names(&child);
        Ok((out, base))
    }

    /// Shape-discovery pass: runs `f` once so its parameters get created and
    /// leaves the caller's counters where the compute pass will find them.
    pub fn init(&self, ctx: &mut Context, state: RevState) -> Result<RevState> {
        let (out, after) = self.invoke(ctx, &Variable::constant(state.x1.clone()))?;
        ctx.adopt_names(&after);
        let out = out.data().clone();
        Ok(RevState {
            x0: state.x1,
            x0_backup: state.x1_backup,
            x1: out,
            x1_backup: state.x0_backup,
        })
    }

    /// Tape-free forward: `(x0, _, x1, _) -> (x1, x1, f(x1) + x0, f(x1) + x0)`.
    pub fn forward(&self, ctx: &mut Context, state: RevState) -> Result<RevState> {
        let detached = ctx.with_fresh_bindings(false);
        let (fx, after) = self.invoke(&detached, &Variable::constant(state.x1.clone()))?;
        ctx.adopt_names(&after);
        let out = (&*fx.data() + &state.x0)?;
        Ok(RevState {
            x0: state.x1.clone(),
            x0_backup: state.x1,
            x1: out.clone(),
            x1_backup: out,
        })
    }

    /// `(d, dy0, y0, dy1, y1) -> (d + d_f, dy1, y1 - f(y0), dx0 + dy0, y0)`
    /// where `d_f` and `dx0` are the VJP of `f` at `y0` with cotangent `dy1`.
    pub fn backward(&self, ctx: &Context, grad: RevGrad) -> Result<RevGrad> {
        let local = ctx.with_fresh_bindings(true);
        let input = Variable::leaf(grad.y0.clone());
        let (fy0, _) = self.invoke(&local, &input)?;
        fy0.backward_with(grad.dy1.clone())?;

        let dx0 = input.grad().unwrap_or_else(|| Tensor::zeros(grad.y0.shape()));
        let x0 = (&grad.y1 - &*fy0.data())?;
        let mut d_params = grad.d_params;
        accumulate_grads(&mut d_params, local.take_param_grads())?;
        trace!(block = self.index, scope = self.snapshot.prefix(), "reversible backward");

        Ok(RevGrad {
            d_params,
            dy0: grad.dy1,
            y0: x0,
            dy1: (&dx0 + &grad.dy0)?,
            y1: grad.y0,
        })
    }
}

/// Blocks applied in order, remembered for the backward walk.
#[derive(Debug, Default)]
pub struct ReversibleStack {
    blocks: Vec<ReversibleBlock>,
}

impl ReversibleStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Defines a block at the caller's current scope and applies it.
    ///
    /// In init mode the block only creates parameters and is not recorded.
    pub fn apply(
        &mut self,
        ctx: &mut Context,
        f: Rc<dyn SubComputation>,
        index: usize,
        state: RevState,
    ) -> Result<RevState> {
        let block = ReversibleBlock::new(ctx, f, index);
        if ctx.is_initializing() {
            return block.init(ctx, state);
        }
        let out = block.forward(ctx, state)?;
        self.blocks.push(block);
        Ok(out)
    }

    /// Walks every recorded block in reverse.
    pub fn backward(&self, ctx: &Context, grad: RevGrad) -> Result<RevGrad> {
        self.blocks
            .iter()
            .rev()
            .try_fold(grad, |grad, block| block.backward(ctx, grad))
    }
}

/// Momentum-net residual branch: `f(x) * (1 - beta) / beta^i`.
pub struct MomentumMain<S> {
    pub inner: S,
    pub beta: f64,
}

impl<S: SubComputation> SubComputation for MomentumMain<S> {
    fn forward(&self, ctx: &mut Context, x: &Variable, index: usize) -> Result<Variable> {
        let out = self.inner.forward(ctx, x, index)?;
        let factor = (1.0 - self.beta) / self.beta.powi(index as i32);
        Ok(out.scale(factor as f32))
    }
}

/// Momentum-net velocity decay: `x * beta^i`.
pub struct MomentumSide {
    pub beta: f64,
}

impl SubComputation for MomentumSide {
    fn forward(&self, _ctx: &mut Context, x: &Variable, index: usize) -> Result<Variable> {
        Ok(x.scale(self.beta.powi(index as i32) as f32))
    }
}
