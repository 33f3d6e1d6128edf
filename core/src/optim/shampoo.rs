//! Shampoo: Kronecker-factored preconditioning.
//!
//! A gradient is reshaped (adjacent small dims merged), cut into blocks no
//! longer than `block_size` along any axis, and every block keeps one
//! statistic `Σ G Gᵀ` per axis. The preconditioned gradient contracts each
//! axis of each block with the inverse `2 * rank`-th root of its statistic.

use super::adam::Ema;
use super::root::{RootConfig, inverse_pth_root};
use super::{read_state, write_state};
use crate::config::OptimizerConfig;
use crate::context::{Context, ParamMeta};
use crate::error::Result;
use crate::tensor::{StorageDtype, Tensor};

/// Merges runs of adjacent dims whose product stays within `max_dim`.
///
/// `[2, 3, 1000, 4]` with `max_dim = 10` becomes `[6, 1000, 4]`.
pub fn merge_small_dims(shape: &[usize], max_dim: usize) -> Vec<usize> {
    let mut merged = Vec::new();
    let mut product = 1;
    for &dim in shape {
        if product * dim <= max_dim {
            product *= dim;
        } else {
            if product > 1 {
                merged.push(product);
            }
            product = dim;
        }
    }
    if product > 1 || merged.is_empty() {
        merged.push(product);
    }
    merged
}

/// Splits a tensor into blocks of at most `block_size` along every axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPartitioner {
    shape: Vec<usize>,
    /// `(start, len)` ranges per axis.
    splits: Vec<Vec<(usize, usize)>>,
}

impl BlockPartitioner {
    pub fn new(shape: &[usize], block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let splits = shape
            .iter()
            .map(|&dim| {
                (0..dim)
                    .step_by(block_size)
                    .map(|start| (start, block_size.min(dim - start)))
                    .collect()
            })
            .collect();
        Self {
            shape: shape.to_vec(),
            splits,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.splits.iter().map(Vec::len).product()
    }

    /// Shapes of every block, in row-major block order.
    pub fn block_shapes(&self) -> Vec<Vec<usize>> {
        let mut shapes = vec![Vec::new()];
        for axis in &self.splits {
            shapes = shapes
                .into_iter()
                .flat_map(|prefix| {
                    axis.iter().map(move |&(_, len)| {
                        let mut shape = prefix.clone();
                        shape.push(len);
                        shape
                    })
                })
                .collect();
        }
        shapes
    }

    pub fn partition(&self, tensor: &Tensor<f64>) -> Result<Vec<Tensor<f64>>> {
        let mut blocks = vec![tensor.clone()];
        for (axis, ranges) in self.splits.iter().enumerate() {
            let mut next = Vec::with_capacity(blocks.len() * ranges.len());
            for block in &blocks {
                for &(start, len) in ranges {
                    next.push(block.narrow(axis, start, len)?);
                }
            }
            blocks = next;
        }
        Ok(blocks)
    }

    /// Inverse of [`partition`](Self::partition).
    pub fn merge(&self, mut blocks: Vec<Tensor<f64>>) -> Result<Tensor<f64>> {
        for (axis, ranges) in self.splits.iter().enumerate().rev() {
            blocks = blocks
                .chunks(ranges.len().max(1))
                .map(|group| Tensor::concat(group, axis))
                .collect::<std::result::Result<_, _>>()?;
        }
        blocks.pop().map_or_else(|| Ok(Tensor::zeros(&self.shape)), Ok)
    }
}

/// Block layout and statistics of one gradient shape.
#[derive(Debug, Clone)]
pub struct Preconditioner {
    original_shape: Vec<usize>,
    transformed_shape: Vec<usize>,
    partitioner: BlockPartitioner,
}

impl Preconditioner {
    pub fn new(shape: &[usize], block_size: usize) -> Self {
        let transformed_shape = merge_small_dims(shape, block_size);
        let partitioner = BlockPartitioner::new(&transformed_shape, block_size);
        Self {
            original_shape: shape.to_vec(),
            transformed_shape,
            partitioner,
        }
    }

    pub fn transformed_shape(&self) -> &[usize] {
        &self.transformed_shape
    }

    /// Root taken of every statistic.
    pub fn exponent(&self) -> usize {
        2 * self.transformed_shape.len()
    }

    /// `[d, d]` shape of every statistic, blocks outer, axes inner.
    pub fn statistic_shapes(&self) -> Vec<[usize; 2]> {
        self.partitioner
            .block_shapes()
            .into_iter()
            .flat_map(|shape| shape.into_iter().map(|d| [d, d]))
            .collect()
    }

    /// Per block and axis, the contraction of the block with itself over
    /// every other axis.
    pub fn statistics_from_grad(&self, grad: &Tensor<f64>) -> Result<Vec<Tensor<f64>>> {
        let reshaped = grad.reshape(&self.transformed_shape)?;
        let rank = self.transformed_shape.len();
        let mut statistics = Vec::with_capacity(self.partitioner.num_blocks() * rank);
        for block in self.partitioner.partition(&reshaped)? {
            for axis in 0..rank {
                let others: Vec<usize> = (0..rank).filter(|&d| d != axis).collect();
                statistics.push(block.tensordot(&block, &others, &others)?);
            }
        }
        Ok(statistics)
    }

    /// Contracts every axis of every block with its root, in the layout of
    /// [`statistics_from_grad`](Self::statistics_from_grad).
    pub fn preconditioned_grad(&self, grad: &Tensor<f64>, roots: &[Tensor<f64>]) -> Result<Tensor<f64>> {
        let reshaped = grad.reshape(&self.transformed_shape)?;
        let rank = self.transformed_shape.len();
        let blocks = self.partitioner.partition(&reshaped)?;
        let mut out = Vec::with_capacity(blocks.len());
        for (block, block_roots) in blocks.into_iter().zip(roots.chunks(rank)) {
            // Each contraction consumes the leading axis and appends the
            // rotated one, so after `rank` steps the axis order is restored.
            let mut current = block;
            for root in block_roots {
                current = current.tensordot(root, &[0], &[0])?;
            }
            out.push(current);
        }
        Ok(self.partitioner.merge(out)?.reshape(&self.original_shape)?)
    }
}

/// Preconditioned direction for one (unstacked) gradient.
///
/// Statistics are heavyball EMAs starting at `eps * I`; their roots are
/// refreshed on steps divisible by `statistics_compute_steps` and otherwise
/// read back from the store.
pub fn shampoo(
    ctx: &mut Context,
    owner: &ParamMeta,
    grad: &Tensor<f64>,
    step: usize,
    config: &OptimizerConfig,
) -> Result<Tensor<f64>> {
    let mut ctx = ctx.add_to_prefix("shampoo");
    let preconditioner = Preconditioner::new(grad.shape(), config.block_size);
    let statistics = preconditioner.statistics_from_grad(grad)?;
    let exponent = preconditioner.exponent();
    let refresh = !ctx.is_initializing() && step % config.statistics_compute_steps.max(1) == 0;
    let root_config = RootConfig::from_optimizer(config);
    let ema = Ema {
        beta: config.shampoo_beta2,
        heavyball: true,
        nesterov: false,
        dtype: StorageDtype::F32,
    };
    let dims = vec!["statistic".to_string(); 2];
    let eps = config.epsilon;

    let mut roots = Vec::with_capacity(statistics.len());
    for (i, statistic) in statistics.iter().enumerate() {
        let n = statistic.shape()[0];
        let statistic = ema.update(&mut ctx, owner, &dims, statistic, step, || Tensor::eye(n).scale(eps))?;
        let name = format!("preconditioner_{i}");
        let root = read_state(&ctx, &name, owner, &dims, StorageDtype::F32, || Tensor::eye(n))?;
        let root = if refresh {
            let fresh = inverse_pth_root(&statistic, exponent, &root_config)?;
            write_state(&ctx, &name, &fresh)?;
            fresh
        } else {
            root
        };
        roots.push(root);
    }
    preconditioner.preconditioned_grad(grad, &roots)
}
