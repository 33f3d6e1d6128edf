use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Reorders the axes of a row-major array.
///
/// Output axis `i` is input axis `axes[i]`. Each output element is gathered
/// from its source offset, so the copy parallelizes over the output.
pub fn cpu_permute<T>(data: &[T], shape: &[usize], axes: &[usize]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let rank = shape.len();
    let mut seen = vec![false; rank];
    let valid = axes.len() == rank
        && axes.iter().all(|&a| {
            if a >= rank || seen[a] {
                return false;
            }
            seen[a] = true;
            true
        });
    if !valid {
        return Err(KernelError::InvalidAxes {
            axes: axes.to_vec(),
            rank,
        });
    }

    if axes.iter().enumerate().all(|(i, &a)| i == a) {
        return Ok(data.to_vec());
    }

    let mut in_strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        in_strides[i] = in_strides[i + 1] * shape[i + 1];
    }
    let out_shape: Vec<usize> = axes.iter().map(|&a| shape[a]).collect();
    let src_strides: Vec<usize> = axes.iter().map(|&a| in_strides[a]).collect();

    let mut out = vec![T::zero(); data.len()];
    out.par_iter_mut().enumerate().for_each(|(linear, o)| {
        let mut rem = linear;
        let mut src = 0;
        for d in (0..rank).rev() {
            let idx = rem % out_shape[d];
            rem /= out_shape[d];
            src += idx * src_strides[d];
        }
        *o = data[src];
    });
    Ok(out)
}
