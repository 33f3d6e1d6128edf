use crate::autograd::Variable;
use crate::tensor::{Result, Tensor};

/// Vector-Jacobian product of `f` at `inputs`.
///
/// Evaluates `f` on fresh gradient-tracking leaves, seeds the backward pass
/// with `cotangent`, and returns the primal output together with one
/// cotangent per input (zeros where the output does not depend on it).
pub fn vjp<F>(f: F, inputs: &[Tensor], cotangent: Tensor) -> Result<(Tensor, Vec<Tensor>)>
where
    F: FnOnce(&[Variable]) -> Result<Variable>,
{
    let leaves: Vec<Variable> = inputs.iter().cloned().map(Variable::leaf).collect();
    let out = f(&leaves)?;
    out.backward_with(cotangent)?;

    let primal = out.data().clone();
    let grads = leaves
        .iter()
        .map(|leaf| leaf.grad().unwrap_or_else(|| Tensor::zeros(&leaf.shape())))
        .collect();
    Ok((primal, grads))
}

/// Value and gradient of a scalar function of one tensor.
pub fn value_and_grad<F>(f: F, x: Tensor) -> Result<(f32, Tensor)>
where
    F: FnOnce(&Variable) -> Result<Variable>,
{
    let (value, mut grads) = vjp(|vars| f(&vars[0]), &[x], Tensor::scalar(1.0))?;
    Ok((value.item()?, grads.remove(0)))
}
