//! Norm-based gradient rescaling: adaptive clipping and grafting.
//!
//! Both work on squared norms, per leading slice for stacked parameters so
//! every head or expert is scaled on its own.

use crate::error::Result;
use crate::tensor::Tensor;

/// Floor for the weight norm, so freshly zeroed parameters still move.
const MIN_WEIGHT_NORM: f64 = 1e-3;
const MIN_DIRECTION_NORM: f64 = 1e-16;

/// Squared norms, one per leading slice if `stacked`, otherwise one in total.
///
/// The result broadcasts against `t`: `[n, 1, ..., 1]` or all ones.
pub fn squared_norm(t: &Tensor<f64>, stacked: bool) -> Result<Tensor<f64>> {
    let rank = t.rank();
    if stacked && rank > 0 {
        let slices = t.shape()[0];
        let row = t.size() / slices.max(1);
        let norms: Vec<f64> = t
            .data()
            .chunks(row.max(1))
            .map(|chunk| chunk.iter().map(|x| x * x).sum())
            .collect();
        let mut shape = vec![1; rank];
        shape[0] = slices;
        Ok(Tensor::new(norms, shape)?)
    } else {
        Ok(Tensor::new(vec![t.sum_squares()], vec![1; rank])?)
    }
}

/// Scales `grad` so its norm stays within `clip` times the parameter norm.
///
/// `factor = min(max(‖w‖, 1e-3) / max(‖g‖, eps) * clip, 1)`
pub fn adaptive_gradient_clipping(
    grad: &Tensor<f64>,
    weight: &Tensor<f64>,
    stacked: bool,
    clip: f64,
    epsilon: f64,
) -> Result<Tensor<f64>> {
    let weight_norm = squared_norm(weight, stacked)?.map(|n| n.sqrt().max(MIN_WEIGHT_NORM));
    let grad_norm = squared_norm(grad, stacked)?.map(|n| n.sqrt().max(epsilon));
    let factor = weight_norm.zip_with(&grad_norm, |w, g| (w / g * clip).min(1.0))?;
    Ok((grad * &factor)?)
}

/// `direction` rescaled to the norm of `magnitude`.
pub fn graft(magnitude: &Tensor<f64>, direction: &Tensor<f64>, stacked: bool) -> Result<Tensor<f64>> {
    let mag = squared_norm(magnitude, stacked)?;
    let dir = squared_norm(direction, stacked)?;
    let factor = mag.zip_with(&dir, |m, d| (m / d.max(MIN_DIRECTION_NORM)).sqrt())?;
    Ok((direction * &factor)?)
}
