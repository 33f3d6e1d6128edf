//! Tensor operations.
//!
//! # Overview
//!
//! - **Element-wise arithmetic**: `+`, `-`, `*`, `/` with NumPy-style broadcasting.
//! - **Reductions**: sums, means and maxima over axes, `sum_to_shape` for
//!   folding broadcast gradients back onto their source shape.
//! - **Contractions**: batched `matmul` and `dot_general` (batch + contracting
//!   axes, output ordered `batch ++ lhs_free ++ rhs_free`).
//! - **Axis plumbing**: `permute`, `narrow`, `concat`, `stack`, row gathers.
//!
//! # Broadcasting
//!
//! Dimensions are aligned from the right; two dimensions are compatible if
//! they are equal or one of them is 1.
//!
//! ```rust
//! use revlm::tensor::Tensor;
//!
//! let a = Tensor::<f32>::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
//! let b = Tensor::<f32>::new(vec![10.0, 20.0], vec![2]).unwrap();
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[11.0, 22.0, 13.0, 24.0]);
//! ```

use super::{Result, Tensor, TensorElem, TensorError, compute_strides};

use rayon::prelude::*;
use revlm_kernels::{cpu_matmul, cpu_permute, cpu_transpose};
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic operation trait (e.g., `Add`, `Sub`) for `&Tensor`.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T> $trait for &Tensor<T>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T>>;

            fn $method(self, rhs: Self) -> Self::Output {
                self.zip_with(rhs, |a, b| a.$method(b))
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

/// Result shape of broadcasting `lhs` against `rhs`.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let l = if i < rank - lhs.len() { 1 } else { lhs[i - (rank - lhs.len())] };
        let r = if i < rank - rhs.len() { 1 } else { rhs[i - (rank - rhs.len())] };
        out[i] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => {
                return Err(TensorError::BroadcastError {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                });
            }
        };
    }
    Ok(out)
}

/// Strides that read `shape` as if it had been broadcast up to `out_shape`.
fn broadcast_strides(shape: &[usize], strides: &[usize], out_shape: &[usize]) -> Vec<usize> {
    let offset = out_shape.len() - shape.len();
    (0..out_shape.len())
        .map(|d| {
            if d < offset || shape[d - offset] == 1 {
                0
            } else {
                strides[d - offset]
            }
        })
        .collect()
}

impl<T> Tensor<T>
where
    T: TensorElem,
{
    /// Applies `f` elementwise over the broadcast of `self` and `rhs`.
    pub fn zip_with<F>(&self, rhs: &Tensor<T>, f: F) -> Result<Tensor<T>>
    where
        F: Fn(T, T) -> T + Sync + Send,
    {
        if self.shape == rhs.shape {
            let mut out = Tensor::zeros(&self.shape);
            out.data
                .as_mut_slice()
                .par_iter_mut()
                .zip(self.data.par_iter())
                .zip(rhs.data.par_iter())
                .for_each(|((o, &a), &b)| *o = f(a, b));
            return Ok(out);
        }

        let out_shape = broadcast_shape(&self.shape, &rhs.shape)?;
        let out_strides = compute_strides(&out_shape);
        let lhs_strides = broadcast_strides(&self.shape, &self.strides, &out_shape);
        let rhs_strides = broadcast_strides(&rhs.shape, &rhs.strides, &out_shape);
        let size: usize = out_shape.iter().product();

        let data = (0..size)
            .into_par_iter()
            .map(|linear| {
                let mut rem = linear;
                let (mut a, mut b) = (0, 0);
                for d in 0..out_shape.len() {
                    let idx = rem / out_strides[d];
                    rem %= out_strides[d];
                    a += idx * lhs_strides[d];
                    b += idx * rhs_strides[d];
                }
                f(self.data[a], rhs.data[b])
            })
            .collect();
        Tensor::new(data, out_shape)
    }

    /// Applies `f` to every element.
    pub fn map<F>(&self, f: F) -> Tensor<T>
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = self.clone();
        out.data.par_iter_mut().for_each(|x| *x = f(*x));
        out
    }

    pub fn scale(&self, factor: T) -> Tensor<T> {
        self.map(|x| x * factor)
    }

    pub fn add_scalar(&self, value: T) -> Tensor<T> {
        self.map(|x| x + value)
    }

    pub fn sum_all(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x)
    }

    /// Sum of squared elements, accumulated in `f64`.
    pub fn sum_squares(&self) -> f64 {
        self.data
            .par_iter()
            .map(|x| {
                let v = x.to_f64().unwrap_or(f64::NAN);
                v * v
            })
            .sum()
    }

    pub fn all_finite(&self) -> bool {
        self.data
            .par_iter()
            .all(|x| x.to_f64().is_some_and(f64::is_finite))
    }

    /// Sums over `axes`. With `keepdim` the reduced axes stay as size 1.
    pub fn sum_axes(&self, axes: &[usize], keepdim: bool) -> Result<Tensor<T>> {
        for &axis in axes {
            self.check_axis(axis)?;
        }
        let kept_shape: Vec<usize> = self
            .shape
            .iter()
            .enumerate()
            .map(|(d, &s)| if axes.contains(&d) { 1 } else { s })
            .collect();
        let kept_strides = compute_strides(&kept_shape);
        let reduce_strides: Vec<usize> = (0..self.rank())
            .map(|d| if axes.contains(&d) { 0 } else { kept_strides[d] })
            .collect();

        let mut out = vec![T::zero(); kept_shape.iter().product()];
        for (linear, &x) in self.data.iter().enumerate() {
            let mut rem = linear;
            let mut target = 0;
            for d in 0..self.rank() {
                let idx = rem / self.strides[d];
                rem %= self.strides[d];
                target += idx * reduce_strides[d];
            }
            out[target] += x;
        }

        let shape = if keepdim {
            kept_shape
        } else {
            self.shape
                .iter()
                .enumerate()
                .filter(|(d, _)| !axes.contains(d))
                .map(|(_, &s)| s)
                .collect()
        };
        Tensor::new(out, shape)
    }

    pub fn mean_axes(&self, axes: &[usize], keepdim: bool) -> Result<Tensor<T>> {
        let count: usize = axes.iter().map(|&a| self.shape.get(a).copied().unwrap_or(1)).product();
        let count = T::from_usize(count.max(1))
            .ok_or_else(|| TensorError::Unsupported("mean count overflow".to_string()))?;
        Ok(self.sum_axes(axes, keepdim)?.map(|x| x / count))
    }

    /// Maximum over one axis, keeping it as size 1.
    pub fn max_axis_keepdim(&self, axis: usize) -> Result<Tensor<T>> {
        self.check_axis(axis)?;
        let outer: usize = self.shape[..axis].iter().product();
        let dim = self.shape[axis];
        let inner: usize = self.shape[axis + 1..].iter().product();
        let mut shape = self.shape.clone();
        shape[axis] = 1;
        if dim == 0 {
            return Err(TensorError::Unsupported("max over empty axis".to_string()));
        }

        let mut out = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            for i in 0..inner {
                let base = o * dim * inner + i;
                let mut best = self.data[base];
                for k in 1..dim {
                    let v = self.data[base + k * inner];
                    if v > best {
                        best = v;
                    }
                }
                out.push(best);
            }
        }
        Tensor::new(out, shape)
    }

    /// Index of the maximum along the last axis.
    pub fn argmax_last(&self) -> Result<Vec<usize>> {
        let dim = *self
            .shape
            .last()
            .ok_or_else(|| TensorError::Unsupported("argmax of a scalar".to_string()))?;
        if dim == 0 {
            return Err(TensorError::Unsupported("argmax over empty axis".to_string()));
        }
        Ok(self
            .data
            .chunks(dim)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, row[0]), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
                    .0
            })
            .collect())
    }

    /// Folds a broadcast result back onto `shape` by summing the expanded axes.
    pub fn sum_to_shape(&self, shape: &[usize]) -> Result<Tensor<T>> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        if shape.len() > self.rank() {
            return Err(TensorError::BroadcastError {
                lhs: self.shape.clone(),
                rhs: shape.to_vec(),
            });
        }
        let offset = self.rank() - shape.len();
        let mut axes: Vec<usize> = (0..offset).collect();
        for (d, &s) in shape.iter().enumerate() {
            let own = self.shape[d + offset];
            if s == 1 && own != 1 {
                axes.push(d + offset);
            } else if s != own {
                return Err(TensorError::BroadcastError {
                    lhs: self.shape.clone(),
                    rhs: shape.to_vec(),
                });
            }
        }
        self.sum_axes(&axes, true)?.reshape(shape)
    }

    /// Reorders axes; output axis `i` is input axis `axes[i]`.
    pub fn permute(&self, axes: &[usize]) -> Result<Tensor<T>> {
        let data = cpu_permute(&self.data, &self.shape, axes)?;
        let shape = axes.iter().map(|&a| self.shape[a]).collect();
        Tensor::new(data, shape)
    }

    /// Swaps the last two axes.
    pub fn transpose(&self) -> Result<Tensor<T>> {
        let data = cpu_transpose(&self.data, &self.shape)?;
        let mut shape = self.shape.clone();
        let rank = shape.len();
        shape.swap(rank - 1, rank - 2);
        Tensor::new(data, shape)
    }

    /// Batched matrix product over the last two axes.
    pub fn matmul(&self, rhs: &Tensor<T>) -> Result<Tensor<T>> {
        let data = cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;
        let mut shape = self.shape.clone();
        let rank = shape.len();
        shape[rank - 1] = rhs.shape[rank - 1];
        Tensor::new(data, shape)
    }

    /// General contraction. Output axes are `batch ++ lhs_free ++ rhs_free`.
    pub fn dot_general(
        &self,
        rhs: &Tensor<T>,
        contract: (&[usize], &[usize]),
        batch: (&[usize], &[usize]),
    ) -> Result<Tensor<T>> {
        let (lhs_contract, rhs_contract) = contract;
        let (lhs_batch, rhs_batch) = batch;
        if lhs_contract.len() != rhs_contract.len() || lhs_batch.len() != rhs_batch.len() {
            return Err(TensorError::Unsupported(
                "dot_general axis lists differ in length".to_string(),
            ));
        }
        for (&l, &r) in lhs_contract.iter().zip(rhs_contract).chain(lhs_batch.iter().zip(rhs_batch)) {
            self.check_axis(l)?;
            rhs.check_axis(r)?;
            if self.shape[l] != rhs.shape[r] {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![self.shape[l]],
                    got: vec![rhs.shape[r]],
                });
            }
        }

        let free = |t: &Tensor<T>, c: &[usize], b: &[usize]| -> Vec<usize> {
            (0..t.rank()).filter(|d| !c.contains(d) && !b.contains(d)).collect()
        };
        let lhs_free = free(self, lhs_contract, lhs_batch);
        let rhs_free = free(rhs, rhs_contract, rhs_batch);
        let size = |t: &Tensor<T>, axes: &[usize]| -> usize { axes.iter().map(|&a| t.shape[a]).product() };

        let b = size(self, lhs_batch);
        let m = size(self, lhs_free.as_slice());
        let k = size(self, lhs_contract);
        let n = size(rhs, rhs_free.as_slice());

        let lhs_order: Vec<usize> = lhs_batch.iter().chain(&lhs_free).chain(lhs_contract).copied().collect();
        let rhs_order: Vec<usize> = rhs_batch.iter().chain(rhs_contract).chain(&rhs_free).copied().collect();
        let lhs3 = self.permute(&lhs_order)?.reshape(&[b, m, k])?;
        let rhs3 = rhs.permute(&rhs_order)?.reshape(&[b, k, n])?;
        let out = lhs3.matmul(&rhs3)?;

        let shape: Vec<usize> = lhs_batch
            .iter()
            .chain(&lhs_free)
            .map(|&a| self.shape[a])
            .chain(rhs_free.iter().map(|&a| rhs.shape[a]))
            .collect();
        out.reshape(&shape)
    }

    /// Contracts `lhs_axes` of `self` with `rhs_axes` of `rhs`.
    pub fn tensordot(&self, rhs: &Tensor<T>, lhs_axes: &[usize], rhs_axes: &[usize]) -> Result<Tensor<T>> {
        self.dot_general(rhs, (lhs_axes, rhs_axes), (&[], &[]))
    }

    /// Slice `[start, start + len)` of `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor<T>> {
        self.check_axis(axis)?;
        let dim = self.shape[axis];
        if start + len > dim {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start + len],
                shape: self.shape.clone(),
            });
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = o * dim * inner + start * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }
        let mut shape = self.shape.clone();
        shape[axis] = len;
        Tensor::new(data, shape)
    }

    /// Selects one index of `axis` and drops that axis.
    pub fn index_axis(&self, axis: usize, index: usize) -> Result<Tensor<T>> {
        let slice = self.narrow(axis, index, 1)?;
        let mut shape = self.shape.clone();
        shape.remove(axis);
        slice.reshape(&shape)
    }

    /// Concatenates tensors along an existing axis.
    pub fn concat(tensors: &[Tensor<T>], axis: usize) -> Result<Tensor<T>> {
        let first = tensors
            .first()
            .ok_or_else(|| TensorError::Unsupported("concat of zero tensors".to_string()))?;
        first.check_axis(axis)?;
        for t in tensors {
            let same_rank = t.rank() == first.rank();
            let same_other = same_rank
                && t.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(d, (a, b))| d == axis || a == b);
            if !same_other {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.clone(),
                    got: t.shape.clone(),
                });
            }
        }

        let outer: usize = first.shape[..axis].iter().product();
        let inner: usize = first.shape[axis + 1..].iter().product();
        let total: usize = tensors.iter().map(|t| t.shape[axis]).sum();
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape[axis] * inner;
                data.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }
        let mut shape = first.shape.clone();
        shape[axis] = total;
        Tensor::new(data, shape)
    }

    /// Stacks equally shaped tensors along a new axis.
    pub fn stack(tensors: &[Tensor<T>], axis: usize) -> Result<Tensor<T>> {
        let expanded = tensors
            .iter()
            .map(|t| {
                if axis > t.rank() {
                    return Err(TensorError::InvalidAxis { axis, rank: t.rank() });
                }
                let mut shape = t.shape.clone();
                shape.insert(axis, 1);
                t.reshape(&shape)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::concat(&expanded, axis)
    }

    /// Gathers rows of the leading axis: `out[i] = self[indices[i]]`.
    pub fn gather_rows(&self, indices: &[usize]) -> Result<Tensor<T>> {
        let rows = *self
            .shape
            .first()
            .ok_or_else(|| TensorError::Unsupported("gather from a scalar".to_string()))?;
        let inner: usize = self.shape[1..].iter().product();
        let mut data = Vec::with_capacity(indices.len() * inner);
        for &i in indices {
            if i >= rows {
                return Err(TensorError::IndexOutOfBounds {
                    index: vec![i],
                    shape: self.shape.clone(),
                });
            }
            data.extend_from_slice(&self.data[i * inner..(i + 1) * inner]);
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Tensor::new(data, shape)
    }

    /// Inverse of `gather_rows`: sums `self[i]` into row `indices[i]` of a zero tensor.
    pub fn scatter_add_rows(&self, indices: &[usize], rows: usize) -> Result<Tensor<T>> {
        if self.shape.first() != Some(&indices.len()) {
            return Err(TensorError::ShapeMismatch {
                expected: vec![indices.len()],
                got: self.shape.clone(),
            });
        }
        let inner: usize = self.shape[1..].iter().product();
        let mut shape = self.shape.clone();
        shape[0] = rows;
        let mut out = Tensor::zeros(&shape);
        for (src, &dst) in indices.iter().enumerate() {
            if dst >= rows {
                return Err(TensorError::IndexOutOfBounds {
                    index: vec![dst],
                    shape: shape.clone(),
                });
            }
            let row = &self.data[src * inner..(src + 1) * inner];
            for (o, &v) in out.data[dst * inner..(dst + 1) * inner].iter_mut().zip(row) {
                *o += v;
            }
        }
        Ok(out)
    }
}
