//! Parameter initializers.
//!
//! Orthogonal matrices come from the reduced QR factorization of a Gaussian
//! matrix in tall orientation with the columns of `Q` multiplied by
//! `sign(diag(R))`, which makes the result Haar-distributed.

use crate::config::Config;
use crate::error::Result;
use crate::tensor::{Tensor, TensorError};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use revlm_kernels::cpu_qr;

/// Standard normal samples.
pub fn normal(rng: &mut StdRng, shape: &[usize]) -> Tensor {
    Tensor::from_fn(shape, |_| rng.sample::<f32, _>(StandardNormal))
}

/// Orthogonal init of `shape`, where the trailing `column_axes` axes form the
/// matrix columns and the rest its rows.
pub fn orthogonal(rng: &mut StdRng, shape: &[usize], column_axes: usize) -> Result<Tensor> {
    let split = shape.len().saturating_sub(column_axes);
    let rows: usize = shape[..split].iter().product();
    let cols: usize = shape[split..].iter().product();
    if rows == 0 || cols == 0 {
        return Ok(Tensor::zeros(shape));
    }
    let (tall, short) = (rows.max(cols), rows.min(cols));

    let gaussian: Vec<f64> = (0..tall * short).map(|_| rng.sample(StandardNormal)).collect();
    let (mut q, r) = cpu_qr(&gaussian, tall, short).map_err(TensorError::from)?;
    for row in q.chunks_mut(short) {
        for (j, v) in row.iter_mut().enumerate() {
            if r[j * short + j] < 0.0 {
                *v = -*v;
            }
        }
    }

    let q = Tensor::new(q.into_iter().map(|v| v as f32).collect(), vec![tall, short])?;
    let matrix = if rows < cols { q.transpose()? } else { q };
    Ok(matrix.reshape(shape)?)
}

/// Orthogonal init that treats `split_dims` as independent stacking axes.
///
/// The first listed split dim present in `dims` is peeled off; every slice
/// along it is initialized independently (recursing with the remaining split
/// dims) and the slices are stacked back in place.
pub fn stacked_orthogonal(
    rng: &mut StdRng,
    config: &Config,
    dims: &[String],
    column_axes: usize,
    split_dims: &[String],
) -> Result<Tensor> {
    let position = split_dims.iter().enumerate().find_map(|(i, split)| {
        dims.iter().position(|d| d == split).map(|axis| (i, axis))
    });
    let Some((used, axis)) = position else {
        let shape = dims.iter().map(|d| config.dim(d)).collect::<Result<Vec<_>>>()?;
        return orthogonal(rng, &shape, column_axes);
    };

    let size = config.dim(&dims[axis])?;
    let mut inner_dims = dims.to_vec();
    inner_dims.remove(axis);
    let slices = (0..size)
        .map(|_| stacked_orthogonal(rng, config, &inner_dims, column_axes, &split_dims[used + 1..]))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&slices, axis)?)
}
