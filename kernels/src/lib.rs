//! CPU kernels backing `revlm` tensors.
//!
//! Every kernel works on flat row-major slices plus an explicit shape, so the
//! main crate can swap implementations without touching `Tensor` itself.

use num_traits::{Float, FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_eigh;
pub mod cpu_matmul;
pub mod cpu_permute;
pub mod cpu_qr;
pub mod cpu_transpose;

pub use cpu_eigh::cpu_eigh;
pub use cpu_matmul::cpu_matmul;
pub use cpu_permute::cpu_permute;
pub use cpu_qr::cpu_qr;
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Invalid axes {axes:?} for rank {rank}")]
    InvalidAxes { axes: Vec<usize>, rank: usize },
    #[error("Kernel requires a tall matrix, got {rows}x{cols}")]
    NotTall { rows: usize, cols: usize },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
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

/// Elements the linear-algebra kernels (QR, eigh) accept.
pub trait LinalgElem: KernelElem + Float {}

impl<T> LinalgElem for T where T: KernelElem + Float {}
