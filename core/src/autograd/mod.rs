//! Automatic Differentiation (Autograd) module.
//!
//! `revlm` implements **reverse-mode AD** with a define-by-run tape: every
//! operation on a gradient-tracking [`Variable`] records a [`Backward`] node
//! pointing at its inputs, and [`Variable::backward`] walks that DAG in reverse
//! topological order applying the chain rule.
//!
//! ```rust
//! use revlm::autograd::Variable;
//! use revlm::tensor::Tensor;
//!
//! let x = Variable::leaf(Tensor::scalar(3.0));
//! let y = x.mul(&x).unwrap();
//! y.backward().unwrap();
//! assert_eq!(x.grad().unwrap().item().unwrap(), 6.0);
//! ```
//!
//! # Custom gradients
//!
//! Several model ops ship a hand-written backward rule instead of composing
//! primitives (instance norm, leaky ReLU, masked softmax, fused cross
//! entropy). [`Variable::custom`] registers such a rule directly.
//!
//! # Detached tapes
//!
//! Variables built from inputs that do not require gradients record nothing.
//! The reversible engine relies on this: its forward pass runs on constants
//! and therefore keeps no activations alive.

use crate::tensor::{Result, Tensor, TensorError};
use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::fmt::Debug;
use std::rc::Rc;

pub mod functional;
pub mod ops;

pub use functional::{value_and_grad, vjp};

/// Boxed backward rule: maps the output cotangent to one optional cotangent per input.
pub type BackwardFn = Box<dyn Fn(&Tensor) -> Result<Vec<Option<Tensor>>>>;

/// A recorded operation that can propagate gradients to its inputs.
pub trait Backward: Debug {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>>;
    fn next_variables(&self) -> Vec<Variable>;
}

/// Backward node backed by a closure.
pub struct FnBackward {
    name: &'static str,
    inputs: Vec<Variable>,
    backward: BackwardFn,
}

impl Debug for FnBackward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBackward")
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

impl Backward for FnBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        (self.backward)(grad_output)
    }

    fn next_variables(&self) -> Vec<Variable> {
        self.inputs.clone()
    }
}

/// A tensor on the tape.
#[derive(Clone)]
pub struct Variable {
    inner: Rc<RefCell<VariableInner>>,
}

struct VariableInner {
    data: Tensor,
    grad: Option<Tensor>,
    requires_grad: bool,
    grad_fn: Option<Rc<dyn Backward>>,
}

impl Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Variable")
            .field("shape", &inner.data.shape())
            .field("requires_grad", &inner.requires_grad)
            .field("grad_fn", &inner.grad_fn)
            .finish()
    }
}

impl Variable {
    pub fn new(data: Tensor, requires_grad: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(VariableInner {
                data,
                grad: None,
                requires_grad,
                grad_fn: None,
            })),
        }
    }

    /// Gradient-tracking leaf.
    pub fn leaf(data: Tensor) -> Self {
        Self::new(data, true)
    }

    /// Value that never receives a gradient.
    pub fn constant(data: Tensor) -> Self {
        Self::new(data, false)
    }

    /// Registers an operation with a hand-written backward rule.
    ///
    /// If no input requires a gradient the result is a plain constant and
    /// nothing is recorded.
    pub fn custom<F>(name: &'static str, data: Tensor, inputs: Vec<Variable>, backward: F) -> Self
    where
        F: Fn(&Tensor) -> Result<Vec<Option<Tensor>>> + 'static,
    {
        if !inputs.iter().any(Variable::requires_grad) {
            return Self::constant(data);
        }
        let node = FnBackward {
            name,
            inputs,
            backward: Box::new(backward),
        };
        Self {
            inner: Rc::new(RefCell::new(VariableInner {
                data,
                grad: None,
                requires_grad: true,
                grad_fn: Some(Rc::new(node)),
            })),
        }
    }

    pub fn data(&self) -> Ref<'_, Tensor> {
        Ref::map(self.inner.borrow(), |inner| &inner.data)
    }

    pub fn shape(&self) -> Vec<usize> {
        self.inner.borrow().data.shape().to_vec()
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.inner.borrow().grad.clone()
    }

    pub fn take_grad(&self) -> Option<Tensor> {
        self.inner.borrow_mut().grad.take()
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.borrow().requires_grad
    }

    /// Copy of the value cut off from the tape.
    pub fn detach(&self) -> Variable {
        Variable::constant(self.data().clone())
    }

    fn id(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    fn parents(&self) -> Vec<Variable> {
        match &self.inner.borrow().grad_fn {
            Some(node) => node.next_variables(),
            None => Vec::new(),
        }
    }

    fn add_grad(&self, g: Tensor) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if g.shape() != inner.data.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: inner.data.shape().to_vec(),
                got: g.shape().to_vec(),
            });
        }
        inner.grad = Some(match inner.grad.take() {
            Some(current) => (&current + &g)?,
            None => g,
        });
        Ok(())
    }

    /// Backpropagates from a scalar output (seed 1).
    pub fn backward(&self) -> Result<()> {
        let seed = Tensor::ones(self.data().shape());
        self.backward_with(seed)
    }

    /// Backpropagates an arbitrary upstream cotangent with the output's shape.
    pub fn backward_with(&self, grad: Tensor) -> Result<()> {
        if !self.requires_grad() {
            return Ok(());
        }
        self.add_grad(grad)?;

        for var in self.topological_order().iter().rev() {
            var.fire_backward()?;
        }
        Ok(())
    }

    /// Inputs-before-outputs ordering of everything reachable from `self`.
    fn topological_order(&self) -> Vec<Variable> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(self.clone(), false)];

        while let Some((var, expanded)) = stack.pop() {
            if expanded {
                order.push(var);
                continue;
            }
            if !visited.insert(var.id()) {
                continue;
            }
            let parents = var.parents();
            stack.push((var, true));
            for parent in parents {
                if parent.requires_grad() && !visited.contains(&parent.id()) {
                    stack.push((parent, false));
                }
            }
        }
        order
    }

    fn fire_backward(&self) -> Result<()> {
        let (grad_fn, grad) = {
            let mut inner = self.inner.borrow_mut();
            let Some(grad_fn) = inner.grad_fn.clone() else {
                return Ok(());
            };
            // Interior nodes release their gradient once it has been pushed upstream.
            let Some(grad) = inner.grad.take() else {
                return Ok(());
            };
            (grad_fn, grad)
        };

        let grads = grad_fn.apply(&grad)?;
        let nexts = grad_fn.next_variables();
        if grads.len() != nexts.len() {
            return Err(TensorError::Unsupported(format!(
                "backward rule returned {} gradients for {} inputs",
                grads.len(),
                nexts.len()
            )));
        }

        for (g, next) in grads.into_iter().zip(nexts) {
            if let Some(g) = g {
                if next.requires_grad() {
                    next.add_grad(g)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_accumulates_across_uses() {
        // y = x * x + x  =>  dy/dx = 2x + 1
        let x = Variable::leaf(Tensor::scalar(2.0));
        let y = x.mul(&x).unwrap().add(&x).unwrap();
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().item().unwrap(), 5.0);
    }

    #[test]
    fn test_constants_record_nothing() {
        let a = Variable::constant(Tensor::scalar(2.0));
        let b = a.mul(&a).unwrap();
        assert!(!b.requires_grad());
        b.backward().unwrap();
        assert!(a.grad().is_none());
    }

    #[test]
    fn test_backward_with_seed() {
        let x = Variable::leaf(Tensor::new(vec![1.0, 2.0], vec![2]).unwrap());
        let y = x.scale(3.0);
        y.backward_with(Tensor::new(vec![1.0, -1.0], vec![2]).unwrap()).unwrap();
        assert_eq!(x.grad().unwrap().data(), &[3.0, -3.0]);
    }

    #[test]
    fn test_backward_seed_shape_checked() {
        let x = Variable::leaf(Tensor::zeros(&[2]));
        let y = x.scale(1.0);
        assert!(y.backward_with(Tensor::zeros(&[3])).is_err());
    }

    #[test]
    fn test_custom_rule() {
        // Straight-through clamp: forward clamps, backward passes dy unchanged.
        let x = Variable::leaf(Tensor::new(vec![-2.0, 0.5, 3.0], vec![3]).unwrap());
        let clamped = x.data().map(|v| v.clamp(-1.0, 1.0));
        let y = Variable::custom("clamp_ste", clamped, vec![x.clone()], |dy| Ok(vec![Some(dy.clone())]));
        assert_eq!(y.data().data(), &[-1.0, 0.5, 1.0]);
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[1.0, 1.0, 1.0]);
    }
}
