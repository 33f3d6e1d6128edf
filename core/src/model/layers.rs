//! Residual branches run inside reversible blocks.
//!
//! Every branch maps `[batch, sequence, heads, features_per_head]` to the same
//! shape. Parameters are declared before the init-mode early return so both
//! passes walk identical names.

use crate::autograd::Variable;
use crate::config::dims::{
    DEPTHWISE_CONV_KERNEL, EXPERTS, FEATURES_PER_HEAD, HEADS, INTERMEDIATE, SPATIAL_MIXING_KERNEL,
};
use crate::config::{BlockKind, spatial_mixing_levels};
use crate::context::{Context, ParamSpec};
use crate::error::{Error, Result};
use crate::reversible::SubComputation;
use crate::tensor::Tensor;

/// A configured branch type as a reversible sub-computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block(pub BlockKind);

impl SubComputation for Block {
    fn forward(&self, ctx: &mut Context, x: &Variable, index: usize) -> Result<Variable> {
        match self.0 {
            BlockKind::FeedForward => feed_forward(ctx, x),
            BlockKind::GroupFeedForward => group_feed_forward(ctx, x),
            BlockKind::Attention => attention(ctx, x),
            BlockKind::SpatialMixing => spatial_mixing(ctx, x, index),
            BlockKind::DepthwiseConv => depthwise_conv(ctx, x),
            BlockKind::Moe => mixture_of_experts(ctx, x),
        }
    }
}

fn activation_scale(ctx: &Context) -> f64 {
    1.0 / ctx.config().model.activation_std()
}

fn depth_scale(ctx: &Context) -> f64 {
    (ctx.config().model.depth as f64).powf(-0.5)
}

fn shape4(x: &Variable) -> Result<[usize; 4]> {
    let shape = x.shape();
    <[usize; 4]>::try_from(shape.as_slice())
        .map_err(|_| Error::Data(format!("expected [batch, sequence, heads, features], got {shape:?}")))
}

/// Per-feature gain applied after instance norm. Declared as a small parameter.
fn norm_scale(ctx: &mut Context) -> Result<Variable> {
    ctx.get_param(
        ParamSpec::new("scale", &[HEADS, FEATURES_PER_HEAD])
            .normal(1.0, 0.0)
            .small(),
    )
}

fn prenorm(ctx: &Context, x: &Variable, scale: &Variable) -> Result<Variable> {
    Ok(x.instance_norm(ctx.config().model.norm_eps)?.mul(scale)?)
}

fn activate(ctx: &Context, x: &Variable) -> Variable {
    x.leaky_relu(ctx.config().model.leaky_relu_slope)
}

/// `[heads, in, out]` and `[heads, out, in]` projection pair.
fn feed_forward_features(ctx: &mut Context, in_dim: &str, out_dim: &str) -> Result<(Variable, Variable)> {
    let inp = ctx.get_param(ParamSpec::new("inp_weight", &[HEADS, in_dim, out_dim]).scale(activation_scale(ctx)))?;
    let out = ctx.get_param(ParamSpec::new("out_weight", &[HEADS, out_dim, in_dim]).scale(depth_scale(ctx)))?;
    Ok((inp, out))
}

/// Dense MLP mixing all heads through a shared intermediate.
pub fn feed_forward(ctx: &mut Context, x: &Variable) -> Result<Variable> {
    let mut ctx = ctx.add_to_prefix("feed_forward");
    let (inp_weight, out_weight) = feed_forward_features(&mut ctx, FEATURES_PER_HEAD, INTERMEDIATE)?;
    let scale = norm_scale(&mut ctx)?;
    if ctx.is_initializing() {
        return Ok(x.clone());
    }

    let normed = prenorm(&ctx, x, &scale)?;
    let mid = activate(&ctx, &normed.contract(&inp_weight, 2)?);
    Ok(mid.contract(&out_weight.permute(&[1, 0, 2])?, 1)?)
}

/// MLP applied to every head independently.
pub fn group_feed_forward(ctx: &mut Context, x: &Variable) -> Result<Variable> {
    let mut ctx = ctx.add_to_prefix("group_feed_forward");
    let (inp_weight, out_weight) = feed_forward_features(&mut ctx, FEATURES_PER_HEAD, INTERMEDIATE)?;
    let scale = norm_scale(&mut ctx)?;
    if ctx.is_initializing() {
        return Ok(x.clone());
    }

    let [batch, sequence, heads, features] = shape4(x)?;
    let normed = prenorm(&ctx, x, &scale)?
        .permute(&[2, 0, 1, 3])?
        .reshape(&[heads, batch * sequence, features])?;
    let mid = activate(&ctx, &normed.bmm(&inp_weight)?);
    Ok(mid
        .bmm(&out_weight)?
        .reshape(&[heads, batch, sequence, features])?
        .permute(&[1, 2, 0, 3])?)
}

/// `mask[i, j] = 1` where `j <= i`.
pub fn causal_mask(sequence: usize) -> Tensor {
    Tensor::from_fn(&[sequence, sequence], |i| {
        if i % sequence <= i / sequence { 1.0 } else { 0.0 }
    })
}

/// Causal multi-head self-attention.
pub fn attention(ctx: &mut Context, x: &Variable) -> Result<Variable> {
    let mut ctx = ctx.add_to_prefix("attention");
    let base_param = ctx.get_param(
        ParamSpec::new("base", &[HEADS, FEATURES_PER_HEAD, INTERMEDIATE]).scale(activation_scale(&ctx)),
    )?;
    let projection = |name: &str| {
        ParamSpec::new(name, &[INTERMEDIATE, HEADS, FEATURES_PER_HEAD])
            .column_axes(2)
            .split_dims(&[])
    };
    let key_param = ctx.get_param(projection("key"))?;
    let qry_param = ctx.get_param(projection("qry"))?;
    let val_param = ctx.get_param(projection("val").scale(depth_scale(&ctx)))?;
    let scale = norm_scale(&mut ctx)?;
    if ctx.is_initializing() {
        return Ok(x.clone());
    }

    let [_, sequence, _, features] = shape4(x)?;
    let base = activate(&ctx, &prenorm(&ctx, x, &scale)?.contract(&base_param, 2)?);
    // [batch, heads, sequence, features]
    let heads_first = |v: Variable| v.permute(&[0, 2, 1, 3]);
    let key = heads_first(base.contract(&key_param, 1)?)?.scale((features as f32).powf(-0.5));
    let qry = heads_first(base.contract(&qry_param, 1)?)?;
    let val = heads_first(base.contract(&val_param, 1)?)?;

    let logits = qry.bmm(&key.permute(&[0, 1, 3, 2])?)?;
    let weights = logits.softmax(Some(&causal_mask(sequence)))?;
    Ok(weights.bmm(&val)?.permute(&[0, 2, 1, 3])?)
}

/// Upper-triangular `[size, size]` mask: position `s` may only feed `t >= s`.
fn upper_triangular(size: usize) -> Tensor {
    Tensor::from_fn(&[size, size], |i| {
        if i / size <= i % size { 1.0 } else { 0.0 }
    })
}

/// Causal token mixing with two masked `[kernel, kernel]` matrices.
///
/// The sequence is viewed as nested axes of `spatial_mixing_kernel` positions
/// each. Layer `depth` mixes along axis `depth % levels`, so positions
/// `kernel^level` apart exchange information and any `levels` consecutive
/// layers reach across the whole sequence.
pub fn spatial_mixing(ctx: &mut Context, x: &Variable, depth: usize) -> Result<Variable> {
    let mut ctx = ctx.add_to_prefix("spatial_mixing");
    let mix_0 = ctx.get_param(
        ParamSpec::new("mix_0", &[SPATIAL_MIXING_KERNEL, SPATIAL_MIXING_KERNEL]).scale(activation_scale(&ctx)),
    )?;
    let mix_1 = ctx.get_param(
        ParamSpec::new("mix_1", &[SPATIAL_MIXING_KERNEL, SPATIAL_MIXING_KERNEL]).scale(depth_scale(&ctx)),
    )?;
    let scale = norm_scale(&mut ctx)?;
    if ctx.is_initializing() {
        return Ok(x.clone());
    }

    let [batch, sequence, heads, features] = shape4(x)?;
    let kernel = ctx.config().dims.spatial_mixing_kernel;
    let levels = spatial_mixing_levels(sequence, kernel).ok_or_else(|| {
        Error::Config(format!("sequence {sequence} is not a power of spatial_mixing_kernel {kernel}"))
    })?;
    let stride = kernel.pow((depth % levels as usize) as u32);
    let width = stride * heads * features;
    let groups = batch * sequence / (kernel * stride);

    let mask = Variable::constant(upper_triangular(kernel));
    // [groups, width, kernel]
    let normed = prenorm(&ctx, x, &scale)?
        .reshape(&[groups, kernel, width])?
        .permute(&[0, 2, 1])?;
    let mid = activate(&ctx, &normed.contract(&mix_0.mul(&mask)?, 1)?);
    Ok(mid
        .contract(&mix_1.mul(&mask)?, 1)?
        .permute(&[0, 2, 1])?
        .reshape(&[batch, sequence, heads, features])?)
}

/// Causal depthwise convolution over the sequence.
pub fn depthwise_conv(ctx: &mut Context, x: &Variable) -> Result<Variable> {
    let mut ctx = ctx.add_to_prefix("depthwise_conv");
    let weight = ctx.get_param(
        ParamSpec::new("conv_weight", &[HEADS, FEATURES_PER_HEAD, DEPTHWISE_CONV_KERNEL])
            .scale(activation_scale(&ctx)),
    )?;
    let scale = norm_scale(&mut ctx)?;
    if ctx.is_initializing() {
        return Ok(x.clone());
    }

    let normed = prenorm(&ctx, x, &scale)?;
    Ok(activate(&ctx, &normed.causal_depthwise_conv(&weight)?))
}

/// Top-1 routed experts with a fixed per-expert capacity.
///
/// Router probabilities are balanced across the batch before assignment, see
/// [`route_top1`]. Tokens left without an expert pass through this branch as
/// zero. `model.z_loss` regularizes the router logits.
pub fn mixture_of_experts(ctx: &mut Context, x: &Variable) -> Result<Variable> {
    let mut ctx = ctx.add_to_prefix("moe");
    let gate = ctx.get_param(ParamSpec::new("gate", &[HEADS, FEATURES_PER_HEAD, EXPERTS]))?;
    let inp_weight = ctx.get_param(
        ParamSpec::new("inp_weight", &[EXPERTS, HEADS, FEATURES_PER_HEAD, INTERMEDIATE])
            .split_dims(&[EXPERTS, HEADS])
            .stacked(true)
            .scale(activation_scale(&ctx)),
    )?;
    let out_weight = ctx.get_param(
        ParamSpec::new("out_weight", &[EXPERTS, INTERMEDIATE, HEADS, FEATURES_PER_HEAD])
            .split_dims(&[EXPERTS])
            .column_axes(2)
            .stacked(true)
            .scale(depth_scale(&ctx)),
    )?;
    let scale = norm_scale(&mut ctx)?;
    if ctx.is_initializing() {
        return Ok(x.clone());
    }

    let [batch, sequence, heads, features] = shape4(x)?;
    let experts = ctx.config().dims.experts;
    let intermediate = ctx.config().dims.intermediate;
    let (tokens, width) = (batch * sequence, heads * features);
    let capacity = ((tokens as f64 / experts as f64) * ctx.config().model.moe_capacity_factor)
        .floor()
        .max(1.0) as usize;

    let normed = prenorm(&ctx, x, &scale)?;
    let probs = normed
        .contract(&gate, 2)?
        .reshape(&[tokens, experts])?
        .router_softmax(ctx.config().model.z_loss)?;
    let routes = route_top1(&probs.data(), capacity)?;

    let mut fill = vec![0usize; experts];
    let (mut kept, mut slots, mut picked) = (Vec::new(), Vec::new(), Vec::new());
    for (token, route) in routes.iter().enumerate() {
        if let Some(expert) = *route {
            kept.push(token);
            slots.push(expert * capacity + fill[expert]);
            picked.push(token * experts + expert);
            fill[expert] += 1;
        }
    }

    let dispatched = normed
        .reshape(&[tokens, width])?
        .gather_rows(&kept)?
        .scatter_rows(&slots, experts * capacity)?
        .reshape(&[experts, capacity, width])?;
    let mid = activate(&ctx, &dispatched.bmm(&inp_weight.reshape(&[experts, width, intermediate])?)?);
    let expert_out = mid
        .bmm(&out_weight.reshape(&[experts, intermediate, width])?)?
        .reshape(&[experts * capacity, width])?
        .gather_rows(&slots)?;
    let route_weight = probs.reshape(&[tokens * experts, 1])?.gather_rows(&picked)?;
    Ok(expert_out
        .mul(&route_weight)?
        .scatter_rows(&kept, tokens)?
        .reshape(&[batch, sequence, heads, features])?)
}

/// Assigns each of `tokens` rows of `[tokens, experts]` router probabilities
/// to at most one expert holding no more than `capacity` tokens.
///
/// Scores are the probabilities divided by each expert's total over the
/// batch, so an expert every token prefers gets a lower score. Tokens are
/// visited in order and take their best-scoring expert that still has room.
pub fn route_top1(probs: &Tensor, capacity: usize) -> Result<Vec<Option<usize>>> {
    let &[tokens, experts] = probs.shape() else {
        return Err(Error::Config(format!("router probabilities of shape {:?}", probs.shape())));
    };
    let totals = probs.sum_axes(&[0], true)?;
    let balanced = (probs / &totals.map(|t| t.max(f32::MIN_POSITIVE)))?;

    let mut fill = vec![0usize; experts];
    let mut routes = Vec::with_capacity(tokens);
    for row in balanced.data().chunks(experts) {
        let mut order: Vec<usize> = (0..experts).collect();
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
        let route = order.into_iter().find(|&e| fill[e] < capacity);
        if let Some(expert) = route {
            fill[expert] += 1;
        }
        routes.push(route);
    }
    Ok(routes)
}
