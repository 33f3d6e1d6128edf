use crate::autograd::Variable;
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Differentiable training objective plus reporting metrics.
#[derive(Debug)]
pub struct LossOutput {
    /// Mean loss over the `top_k` hardest sequences; equals `loss` when
    /// `loss_top_p` keeps the whole batch.
    pub top_loss: Variable,
    pub loss: f32,
    pub accuracy: f32,
}

/// Number of sequences kept by the top-p loss, rounded up to a multiple of `snap`.
pub fn top_k(batch: usize, top_p: f64, snap: usize) -> usize {
    let snap = snap.max(1);
    ((batch as f64 * top_p / snap as f64).ceil() as usize) * snap
}

/// Cross entropy of `[batch, sequence, vocab]` logits against `targets`.
///
/// Each sequence's loss is the mean over its tokens; `loss` is the mean over
/// sequences. With `loss_top_p < 1` only the hardest sequences enter the
/// differentiated `top_loss`.
pub fn language_model_loss(logits: &Variable, targets: &[usize], config: &ModelConfig) -> Result<LossOutput> {
    let shape = logits.shape();
    let &[batch, sequence, vocab] = shape.as_slice() else {
        return Err(Error::Data(format!("expected [batch, sequence, vocab] logits, got {shape:?}")));
    };
    let flat = logits.reshape(&[batch * sequence, vocab])?;
    let token_losses = flat.cross_entropy(targets, config.z_loss)?;
    let per_token = Variable::constant(Tensor::full(&[sequence], 1.0 / sequence as f32));
    let sequence_losses = token_losses.reshape(&[batch, sequence])?.contract(&per_token, 1)?;
    let mean = sequence_losses.mean_all();
    let loss = mean.data().item()?;

    let k = top_k(batch, config.loss_top_p, config.loss_top_snap);
    let top_loss = if config.loss_top_p < 1.0 && k < batch {
        let values = sequence_losses.data().clone();
        let mut order: Vec<usize> = (0..batch).collect();
        order.sort_by(|&a, &b| values.data()[b].total_cmp(&values.data()[a]));
        order.truncate(k);
        sequence_losses.gather_rows(&order)?.mean_all()
    } else {
        mean
    };

    let predictions = flat.data().argmax_last()?;
    let correct = predictions.iter().zip(targets).filter(|(p, t)| p == t).count();
    let accuracy = correct as f32 / targets.len().max(1) as f32;

    Ok(LossOutput {
        top_loss,
        loss,
        accuracy,
    })
}
