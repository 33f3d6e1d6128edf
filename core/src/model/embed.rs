use crate::autograd::Variable;
use crate::config::dims::{FEATURES_PER_HEAD, HEADS, VOCAB};
use crate::context::{Context, ParamSpec};
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Fixed sinusoidal position code, `[sequence, heads, features_per_head]`.
///
/// Frequencies grow geometrically over the flattened feature axis so the
/// slowest one completes roughly a quarter turn across the sequence.
pub fn position_embedding(sequence: usize, heads: usize, features: usize) -> Tensor {
    let feature_count = (heads * features).max(1) as f64;
    let offset = (sequence as f64 / 2.0 / std::f64::consts::PI).ln();
    Tensor::from_fn(&[sequence, heads, features], |i| {
        let position = (i / (heads * features)) as f64;
        let feature = (i % (heads * features)) as f64;
        let frequency = (feature * 4.0 / feature_count - offset).exp();
        (frequency * position).sin() as f32
    })
}

/// Token embedding plus position code: `[batch, sequence]` ids to
/// `[batch, sequence, heads, features_per_head]`.
pub fn input_embed(ctx: &mut Context, tokens: &[usize], batch: usize, sequence: usize) -> Result<Variable> {
    let mut ctx = ctx.add_to_prefix("input_embed");
    let table = ctx.get_param(ParamSpec::new("inp_embd", &[VOCAB, HEADS, FEATURES_PER_HEAD]))?;
    let (heads, features) = (ctx.config().dims.heads, ctx.config().dims.features_per_head);
    if ctx.is_initializing() {
        return Ok(Variable::constant(Tensor::zeros(&[batch, sequence, heads, features])));
    }
    if tokens.len() != batch * sequence {
        return Err(Error::Data(format!(
            "expected {} tokens for a [{batch}, {sequence}] batch, got {}",
            batch * sequence,
            tokens.len()
        )));
    }

    let embedded = table
        .gather_rows(tokens)?
        .reshape(&[batch, sequence, heads, features])?;
    let position = Variable::constant(position_embedding(sequence, heads, features));
    Ok(embedded.add(&position)?)
}

/// Projects `[batch, sequence, heads, features_per_head]` to vocabulary logits.
///
/// The projection starts at zero, so a fresh model predicts uniformly.
pub fn output_embed(ctx: &mut Context, x: &Variable) -> Result<Variable> {
    let mut ctx = ctx.add_to_prefix("output_embed");
    let weight = ctx.get_param(ParamSpec::new("weight", &[HEADS, FEATURES_PER_HEAD, VOCAB]).zeros())?;
    if ctx.is_initializing() {
        return Ok(x.clone());
    }
    Ok(x.contract(&weight, 2)?)
}
