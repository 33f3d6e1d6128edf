use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// CPU batched matrix multiplication.
///
/// `lhs` is `[batch..., M, K]` and `rhs` is `[batch..., K, N]`; leading batch
/// dimensions must match exactly. Rank-2 inputs are a single matrix product.
///
/// The rhs is transposed first so that every output element is a dot product
/// of two contiguous rows, then output rows are filled in parallel.
pub fn cpu_matmul<T>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize],
    rhs_shape: &[usize],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let rank = lhs_shape.len();
    if rank < 2 || rhs_shape.len() != rank || lhs_shape[..rank - 2] != rhs_shape[..rank - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape.to_vec(),
            got: rhs_shape.to_vec(),
        });
    }

    let m = lhs_shape[rank - 2];
    let k = lhs_shape[rank - 1];
    let n = rhs_shape[rank - 1];

    if k != rhs_shape[rank - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[rank - 2]],
        });
    }

    let batch: usize = lhs_shape[..rank - 2].iter().product();
    let mut out_data = vec![T::zero(); batch * m * n];
    if n == 0 || m == 0 {
        return Ok(out_data);
    }

    // rhs is [..., K, N], we want [..., N, K]
    let rhs_t_data = super::cpu_transpose::cpu_transpose(rhs_data, rhs_shape)?;

    out_data
        .as_mut_slice()
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(global_row_idx, out_row)| {
            let batch_idx = global_row_idx / m;
            let row_in_matrix = global_row_idx % m;

            let a_row_start = batch_idx * m * k + row_in_matrix * k;
            let a_slice = &lhs_data[a_row_start..a_row_start + k];
            let b_t_batch_offset = batch_idx * n * k;

            for (col_in_matrix, out_elem) in out_row.iter_mut().enumerate() {
                let b_t_row_start = b_t_batch_offset + col_in_matrix * k;
                let b_t_slice = &rhs_t_data[b_t_row_start..b_t_row_start + k];

                let mut sum = T::zero();
                for (&val_a, &val_b) in a_slice.iter().zip(b_t_slice.iter()) {
                    sum += val_a * val_b;
                }
                *out_elem = sum;
            }
        });

    Ok(out_data)
}
