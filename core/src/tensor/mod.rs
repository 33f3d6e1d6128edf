//! Core Tensor implementation.
//!
//! A `Tensor` is a flat row-major buffer plus a dynamic shape. Every parameter,
//! activation, gradient and optimizer statistic in `revlm` is one of these.
//!
//! ```rust
//! use revlm::tensor::Tensor;
//!
//! let tensor = Tensor::<f32>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! ```
//!
//! > [!TIP]
//! > Rank is a runtime property. Parameters are declared with symbolic dims
//! > (`heads`, `features_per_head`, ...) whose sizes only exist in the config,
//! > so a const-rank type would buy nothing here.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use revlm_kernels::KernelError;
use std::fmt::Debug;
use thiserror::Error;

pub mod ops;
pub mod precision;

pub use precision::StorageDtype;

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// Two shapes cannot be broadcast together.
    #[error("Cannot broadcast {lhs:?} with {rhs:?}")]
    BroadcastError { lhs: Vec<usize>, rhs: Vec<usize> },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// An axis argument does not exist for the tensor's rank.
    #[error("Invalid axis {axis} for rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// # Requirements
/// - `Copy + Clone`: Essential for efficient storage in contiguous memory and fast element access.
/// - `Num + ...`: Provides necessary numeric operations for tensor math.
/// - `Send + Sync`: Required for parallel execution via `rayon`.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// N-dimensional row-major array.
///
/// `f32` is the compute type for the model; the optimizer lifts parameters to
/// `f64` for its arithmetic and writes them back.
#[derive(Clone, PartialEq)]
pub struct Tensor<T = f32>
where
    T: TensorElem,
{
    shape: Vec<usize>,
    strides: Vec<usize>,
    data: Vec<T>,
}

impl<T> Tensor<T>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        let strides = compute_strides(&shape);
        Ok(Self {
            shape,
            strides,
            data,
        })
    }

    /// Creates a new Tensor filled with `value`.
    pub fn full(shape: &[usize], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            data: vec![value; size],
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, T::zero())
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, T::one())
    }

    /// Rank-0 tensor holding a single value.
    pub fn scalar(value: T) -> Self {
        Self::full(&[], value)
    }

    /// `n x n` identity matrix.
    pub fn eye(n: usize) -> Self {
        let mut out = Self::zeros(&[n, n]);
        for i in 0..n {
            out.data[i * n + i] = T::one();
        }
        out
    }

    /// Builds a tensor by evaluating `f` at every flat index.
    pub fn from_fn(shape: &[usize], f: impl FnMut(usize) -> T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            data: (0..size).map(f).collect(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns a reference to the underlying data as a flat slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<T> {
        if index.len() != self.rank() || index.iter().zip(&self.shape).any(|(i, d)| i >= d) {
            return Err(TensorError::IndexOutOfBounds {
                index: index.to_vec(),
                shape: self.shape.clone(),
            });
        }
        let offset: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
        Ok(self.data[offset])
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<T> {
        match self.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(TensorError::ShapeMismatch {
                expected: vec![1],
                got: self.shape.clone(),
            }),
        }
    }

    /// Reshapes the tensor without copying data.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if size != self.size() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: shape.to_vec(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            data: self.data.clone(),
        })
    }

    /// Converts every element to another element type.
    pub fn cast<U: TensorElem>(&self) -> Result<Tensor<U>> {
        let data = self
            .data
            .iter()
            .map(|x| x.to_f64().and_then(U::from_f64))
            .collect::<Option<Vec<U>>>()
            .ok_or_else(|| TensorError::Unsupported("lossy element cast".to_string()))?;
        Tensor::new(data, self.shape.clone())
    }

    pub(crate) fn check_axis(&self, axis: usize) -> Result<()> {
        if axis >= self.rank() {
            return Err(TensorError::InvalidAxis {
                axis,
                rank: self.rank(),
            });
        }
        Ok(())
    }
}

/// Computes the strides for a given shape (row-major).
pub(crate) fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

impl<T> Debug for Tensor<T>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const PREVIEW: usize = 8;
        let preview = &self.data[..self.data.len().min(PREVIEW)];
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data", &preview)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        let t = Tensor::<f32>::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.strides(), &[2, 1]);
        assert_eq!(t.size(), 4);
    }

    #[test]
    fn test_tensor_creation_mismatch() {
        let res = Tensor::<f32>::new(vec![1.0, 2.0, 3.0], vec![2, 2]);
        assert!(matches!(res, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_strides_rank3() {
        let t = Tensor::<f32>::zeros(&[2, 3, 4]);
        assert_eq!(t.strides(), &[12, 4, 1]);
    }

    #[test]
    fn test_scalar_and_item() {
        let s = Tensor::scalar(3.5f32);
        assert_eq!(s.rank(), 0);
        assert_eq!(s.item().unwrap(), 3.5);

        let v = Tensor::<f32>::ones(&[2]);
        assert!(v.item().is_err());
    }

    #[test]
    fn test_get_and_bounds() {
        let t = Tensor::<f32>::new((0..6).map(|x| x as f32).collect(), vec![2, 3]).unwrap();
        assert_eq!(t.get(&[1, 2]).unwrap(), 5.0);
        assert!(matches!(
            t.get(&[2, 0]),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_reshape() {
        let t = Tensor::<f32>::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let r = t.reshape(&[4]).unwrap();
        assert_eq!(r.shape(), &[4]);
        assert_eq!(r.data(), t.data());
        assert!(t.reshape(&[3]).is_err());
    }

    #[test]
    fn test_eye_and_cast() {
        let e = Tensor::<f64>::eye(3);
        assert_eq!(e.get(&[1, 1]).unwrap(), 1.0);
        assert_eq!(e.get(&[0, 1]).unwrap(), 0.0);
        let f: Tensor<f32> = e.cast().unwrap();
        assert_eq!(f.data().iter().sum::<f32>(), 3.0);
    }
}
