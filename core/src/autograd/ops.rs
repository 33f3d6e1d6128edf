//! Differentiable operations on [`Variable`].
//!
//! Elementwise ops broadcast like their tensor counterparts; their backward
//! rules fold the cotangent back onto each input's shape with `sum_to_shape`.
//! The model-specific ops at the bottom carry hand-written backward rules.

use super::Variable;
use crate::tensor::{Result, Tensor, TensorError};

impl Variable {
    pub fn add(&self, rhs: &Variable) -> Result<Variable> {
        let out = (&*self.data() + &*rhs.data())?;
        let (ls, rs) = (self.shape(), rhs.shape());
        Ok(Variable::custom("add", out, vec![self.clone(), rhs.clone()], move |g| {
            Ok(vec![Some(g.sum_to_shape(&ls)?), Some(g.sum_to_shape(&rs)?)])
        }))
    }

    pub fn sub(&self, rhs: &Variable) -> Result<Variable> {
        let out = (&*self.data() - &*rhs.data())?;
        let (ls, rs) = (self.shape(), rhs.shape());
        Ok(Variable::custom("sub", out, vec![self.clone(), rhs.clone()], move |g| {
            Ok(vec![
                Some(g.sum_to_shape(&ls)?),
                Some(g.scale(-1.0).sum_to_shape(&rs)?),
            ])
        }))
    }

    pub fn mul(&self, rhs: &Variable) -> Result<Variable> {
        let a = self.data().clone();
        let b = rhs.data().clone();
        let out = (&a * &b)?;
        Ok(Variable::custom("mul", out, vec![self.clone(), rhs.clone()], move |g| {
            Ok(vec![
                Some((g * &b)?.sum_to_shape(a.shape())?),
                Some((g * &a)?.sum_to_shape(b.shape())?),
            ])
        }))
    }

    /// Multiplies by a constant factor.
    pub fn scale(&self, factor: f32) -> Variable {
        let out = self.data().scale(factor);
        Variable::custom("scale", out, vec![self.clone()], move |g| Ok(vec![Some(g.scale(factor))]))
    }

    pub fn sum_all(&self) -> Variable {
        let shape = self.shape();
        let out = Tensor::scalar(self.data().sum_all());
        Variable::custom("sum_all", out, vec![self.clone()], move |g| {
            Ok(vec![Some(Tensor::full(&shape, g.item()?))])
        })
    }

    pub fn mean_all(&self) -> Variable {
        let count = self.data().size().max(1) as f32;
        self.sum_all().scale(1.0 / count)
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Variable> {
        let original = self.shape();
        let out = self.data().reshape(shape)?;
        Ok(Variable::custom("reshape", out, vec![self.clone()], move |g| {
            Ok(vec![Some(g.reshape(&original)?)])
        }))
    }

    pub fn permute(&self, axes: &[usize]) -> Result<Variable> {
        let out = self.data().permute(axes)?;
        let mut inverse = vec![0; axes.len()];
        for (i, &a) in axes.iter().enumerate() {
            inverse[a] = i;
        }
        Ok(Variable::custom("permute", out, vec![self.clone()], move |g| {
            Ok(vec![Some(g.permute(&inverse)?)])
        }))
    }

    /// Contracts the last `reduced` axes of `self` with the first `reduced` axes of `rhs`.
    pub fn contract(&self, rhs: &Variable, reduced: usize) -> Result<Variable> {
        let (ls, rs) = (self.shape(), rhs.shape());
        if reduced > ls.len() || reduced > rs.len() || ls[ls.len() - reduced..] != rs[..reduced] {
            return Err(TensorError::ShapeMismatch {
                expected: ls.clone(),
                got: rs.clone(),
            });
        }
        let m: usize = ls[..ls.len() - reduced].iter().product();
        let k: usize = rs[..reduced].iter().product();
        let n: usize = rs[reduced..].iter().product();
        let a2 = self.data().reshape(&[m, k])?;
        let b2 = rhs.data().reshape(&[k, n])?;
        let out_shape: Vec<usize> = ls[..ls.len() - reduced].iter().chain(&rs[reduced..]).copied().collect();
        let out = a2.matmul(&b2)?.reshape(&out_shape)?;

        Ok(Variable::custom("contract", out, vec![self.clone(), rhs.clone()], move |g| {
            let g2 = g.reshape(&[m, n])?;
            let ga = g2.matmul(&b2.transpose()?)?.reshape(&ls)?;
            let gb = a2.transpose()?.matmul(&g2)?.reshape(&rs)?;
            Ok(vec![Some(ga), Some(gb)])
        }))
    }

    /// Batched matmul over the last two axes, batch axes must match.
    pub fn bmm(&self, rhs: &Variable) -> Result<Variable> {
        let a = self.data().clone();
        let b = rhs.data().clone();
        let out = a.matmul(&b)?;
        Ok(Variable::custom("bmm", out, vec![self.clone(), rhs.clone()], move |g| {
            let ga = g.matmul(&b.transpose()?)?;
            let gb = a.transpose()?.matmul(g)?;
            Ok(vec![Some(ga), Some(gb)])
        }))
    }

    /// Rows of the leading axis selected by `indices`.
    pub fn gather_rows(&self, indices: &[usize]) -> Result<Variable> {
        let rows = self.shape().first().copied().unwrap_or(0);
        let out = self.data().gather_rows(indices)?;
        let indices = indices.to_vec();
        Ok(Variable::custom("gather_rows", out, vec![self.clone()], move |g| {
            Ok(vec![Some(g.scatter_add_rows(&indices, rows)?)])
        }))
    }

    /// Scatters row `i` of `self` into row `indices[i]` of a `rows`-row zero tensor.
    pub fn scatter_rows(&self, indices: &[usize], rows: usize) -> Result<Variable> {
        let out = self.data().scatter_add_rows(indices, rows)?;
        let indices = indices.to_vec();
        Ok(Variable::custom("scatter_rows", out, vec![self.clone()], move |g| {
            Ok(vec![Some(g.gather_rows(&indices)?)])
        }))
    }

    /// Leaky ReLU. The backward rule reads the sign off the output.
    pub fn leaky_relu(&self, slope: f32) -> Variable {
        let out = self.data().map(|x| if x > 0.0 { x } else { x * slope });
        let saved = out.clone();
        Variable::custom("leaky_relu", out, vec![self.clone()], move |g| {
            let dx = g.zip_with(&saved, |dy, y| if y > 0.0 { dy } else { dy * slope })?;
            Ok(vec![Some(dx)])
        })
    }

    /// Zero-mean, unit-RMS normalization over the last axis.
    pub fn instance_norm(&self, eps: f32) -> Result<Variable> {
        let x = self.data().clone();
        let last = x.rank().checked_sub(1).ok_or_else(|| {
            TensorError::Unsupported("instance_norm of a scalar".to_string())
        })?;
        let mean = x.mean_axes(&[last], true)?;
        let centered = (&x - &mean)?;
        let variance = centered.map(|v| v * v).mean_axes(&[last], true)?;
        let scale = variance.map(|v| (eps + v).sqrt().recip());
        let out = (&centered * &scale)?;
        let saved = out.clone();

        Ok(Variable::custom("instance_norm", out, vec![self.clone()], move |g| {
            let dy = (g * &scale)?;
            let proj = (&dy * &saved)?.mean_axes(&[last], true)?;
            let dy = (&dy - &(&proj * &saved)?)?;
            let centre = dy.mean_axes(&[last], true)?;
            Ok(vec![Some((&dy - &centre)?)])
        }))
    }

    /// Softmax over the last axis. `mask` entries equal to zero are excluded.
    pub fn softmax(&self, mask: Option<&Tensor>) -> Result<Variable> {
        let x = self.data().clone();
        let last = x.rank().checked_sub(1).ok_or_else(|| {
            TensorError::Unsupported("softmax of a scalar".to_string())
        })?;
        let masked = match mask {
            Some(m) => x.zip_with(m, |v, keep| if keep != 0.0 { v } else { f32::NEG_INFINITY })?,
            None => x,
        };
        let max = masked.max_axis_keepdim(last)?;
        let exp = (&masked - &max)?.map(f32::exp);
        let total = exp.sum_axes(&[last], true)?;
        let out = (&exp / &total)?;
        let saved = out.clone();

        Ok(Variable::custom("softmax", out, vec![self.clone()], move |g| {
            let dot = (g * &saved)?.sum_axes(&[last], true)?;
            Ok(vec![Some((&saved * &(g - &dot)?)?)])
        }))
    }

    /// Causal depthwise convolution along the sequence axis.
    ///
    /// `self` is `[batch, sequence, heads, features]` and `weight` is
    /// `[heads, features, kernel]`; output position `s` sees inputs
    /// `s - kernel + 1 ..= s` (zero padded on the left).
    pub fn causal_depthwise_conv(&self, weight: &Variable) -> Result<Variable> {
        let x = self.data().clone();
        let w = weight.data().clone();
        let xs = x.shape().to_vec();
        let ws = w.shape().to_vec();
        if xs.len() != 4 || ws.len() != 3 || xs[2] != ws[0] || xs[3] != ws[1] {
            return Err(TensorError::ShapeMismatch {
                expected: xs,
                got: ws,
            });
        }
        let (batch, seq, channels, kernel) = (xs[0], xs[1], xs[2] * xs[3], ws[2]);
        let at = move |b: usize, s: usize, c: usize| (b * seq + s) * channels + c;

        let mut out = Tensor::zeros(&xs);
        {
            let (xd, wd, od) = (x.data(), w.data(), out.data_mut());
            for b in 0..batch {
                for s in 0..seq {
                    for c in 0..channels {
                        let mut acc = 0.0;
                        for k in 0..kernel {
                            if let Some(src) = (s + k + 1).checked_sub(kernel) {
                                acc += wd[c * kernel + k] * xd[at(b, src, c)];
                            }
                        }
                        od[at(b, s, c)] = acc;
                    }
                }
            }
        }

        Ok(Variable::custom("causal_depthwise_conv", out, vec![self.clone(), weight.clone()], move |g| {
            let mut dx = Tensor::zeros(&xs);
            let mut dw = Tensor::zeros(&ws);
            {
                let (xd, wd, gd) = (x.data(), w.data(), g.data());
                let dxd = dx.data_mut();
                for b in 0..batch {
                    for s in 0..seq {
                        for c in 0..channels {
                            let dy = gd[at(b, s, c)];
                            for k in 0..kernel {
                                if let Some(src) = (s + k + 1).checked_sub(kernel) {
                                    dxd[at(b, src, c)] += wd[c * kernel + k] * dy;
                                }
                            }
                        }
                    }
                }
                let dwd = dw.data_mut();
                for b in 0..batch {
                    for s in 0..seq {
                        for c in 0..channels {
                            let dy = gd[at(b, s, c)];
                            for k in 0..kernel {
                                if let Some(src) = (s + k + 1).checked_sub(kernel) {
                                    dwd[c * kernel + k] += xd[at(b, src, c)] * dy;
                                }
                            }
                        }
                    }
                }
            }
            Ok(vec![Some(dx), Some(dw)])
        }))
    }

    /// Per-row softmax cross entropy of `[rows, vocab]` logits.
    ///
    /// Returns the unreduced `[rows]` losses. A non-zero `z_loss` adds the
    /// gradient of `z_loss * mean(logsumexp^2)` without changing the value.
    pub fn cross_entropy(&self, targets: &[usize], z_loss: f32) -> Result<Variable> {
        let logits = self.data().clone();
        let shape = logits.shape().to_vec();
        if shape.len() != 2 || shape[0] != targets.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![targets.len(), shape.last().copied().unwrap_or(0)],
                got: shape,
            });
        }
        let (rows, vocab) = (shape[0], shape[1]);
        if let Some(&bad) = targets.iter().find(|&&t| t >= vocab) {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![bad],
                shape: vec![vocab],
            });
        }

        let mut probs = Vec::with_capacity(rows * vocab);
        let mut lse = Vec::with_capacity(rows);
        let mut losses = Vec::with_capacity(rows);
        for (row, &target) in logits.data().chunks(vocab).zip(targets) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let total: f32 = row.iter().map(|v| (v - max).exp()).sum();
            let log_z = max + total.ln();
            probs.extend(row.iter().map(|v| (v - log_z).exp()));
            lse.push(log_z);
            losses.push(log_z - row[target]);
        }
        let out = Tensor::new(losses, vec![rows])?;
        let targets = targets.to_vec();

        Ok(Variable::custom("cross_entropy", out, vec![self.clone()], move |g| {
            let mut dx = probs.clone();
            for (r, &target) in targets.iter().enumerate() {
                let dy = g.data()[r];
                let z = 2.0 * z_loss * lse[r] / rows as f32;
                for (v, d) in dx[r * vocab..(r + 1) * vocab].iter_mut().enumerate() {
                    let p = *d;
                    let hot = if v == target { 1.0 } else { 0.0 };
                    *d = dy * (p - hot) + z * p;
                }
            }
            Ok(vec![Some(Tensor::new(dx, vec![rows, vocab])?)])
        }))
    }

    /// Row softmax of `[tokens, experts]` router logits.
    ///
    /// The value is a plain softmax. A non-zero `z_loss` adds two terms to the
    /// backward pass only: the gradient of `z_loss * mean(logsumexp^2)` on the
    /// logits, and `z_loss * p / (tokens * experts)` on the probabilities.
    pub fn router_softmax(&self, z_loss: f32) -> Result<Variable> {
        let logits = self.data().clone();
        let shape = logits.shape().to_vec();
        let &[tokens, experts] = shape.as_slice() else {
            return Err(TensorError::Unsupported(format!("router logits of shape {shape:?}")));
        };

        let mut probs = Vec::with_capacity(tokens * experts);
        let mut lse = Vec::with_capacity(tokens);
        for row in logits.data().chunks(experts) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_z = max + row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
            probs.extend(row.iter().map(|v| (v - log_z).exp()));
            lse.push(log_z);
        }
        let out = Tensor::new(probs.clone(), shape.clone())?;

        Ok(Variable::custom("router_softmax", out, vec![self.clone()], move |g| {
            let aux = z_loss / (tokens * experts).max(1) as f32;
            let mut dx = vec![0.0; tokens * experts];
            for t in 0..tokens {
                let row = t * experts..(t + 1) * experts;
                let (p, gr) = (&probs[row.clone()], &g.data()[row.clone()]);
                let dp: Vec<f32> = p.iter().zip(gr).map(|(p, g)| g + aux * p).collect();
                let dot: f32 = p.iter().zip(&dp).map(|(p, d)| p * d).sum();
                let z = 2.0 * z_loss * lse[t] / tokens as f32;
                for ((d, p), dp) in dx[row].iter_mut().zip(p).zip(&dp) {
                    *d = p * (dp - dot) + z * p;
                }
            }
            Ok(vec![Some(Tensor::new(dx, shape.clone())?)])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_grad(f: impl Fn(&Tensor) -> f32, x: &Tensor) -> Tensor {
        let h = 1e-2;
        let mut out = Tensor::zeros(x.shape());
        for i in 0..x.size() {
            let mut plus = x.clone();
            plus.data_mut()[i] += h;
            let mut minus = x.clone();
            minus.data_mut()[i] -= h;
            out.data_mut()[i] = (f(&plus) - f(&minus)) / (2.0 * h);
        }
        out
    }

    fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.data().iter().zip(b.data()) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    fn weighted_sum(v: &Variable, weights: &Tensor) -> Variable {
        v.mul(&Variable::constant(weights.clone())).unwrap().sum_all()
    }

    #[test]
    fn test_broadcast_add_grad() {
        let a = Variable::leaf(Tensor::zeros(&[2, 3]));
        let b = Variable::leaf(Tensor::zeros(&[3]));
        a.add(&b).unwrap().sum_all().backward().unwrap();
        assert_eq!(b.grad().unwrap().data(), &[2.0, 2.0, 2.0]);
        assert_eq!(a.grad().unwrap().data(), &[1.0; 6]);
    }

    #[test]
    fn test_contract_grad_matches_numeric() {
        let a = Tensor::from_fn(&[2, 2, 3], |i| (i as f32 * 0.37).sin());
        let b = Tensor::from_fn(&[2, 3, 2], |i| (i as f32 * 0.11).cos());
        let weights = Tensor::from_fn(&[2, 2], |i| i as f32 - 1.5);

        let av = Variable::leaf(a.clone());
        let bv = Variable::leaf(b.clone());
        weighted_sum(&av.contract(&bv, 2).unwrap(), &weights).backward().unwrap();

        let f = |t: &Tensor| {
            let y = Variable::constant(t.clone()).contract(&Variable::constant(b.clone()), 2).unwrap();
            (&*y.data() * &weights).unwrap().sum_all()
        };
        assert_close(&av.grad().unwrap(), &numeric_grad(f, &a), 1e-2);
    }

    #[test]
    fn test_bmm_and_permute_grad() {
        let a = Tensor::from_fn(&[2, 2, 3], |i| (i as f32 * 0.5).sin());
        let b = Tensor::from_fn(&[2, 3, 2], |i| (i as f32 * 0.3).cos());
        let weights = Tensor::from_fn(&[2, 2, 2], |i| (i % 3) as f32);

        let bv = Variable::leaf(b.clone());
        let y = Variable::constant(a.clone()).bmm(&bv).unwrap().permute(&[2, 0, 1]).unwrap();
        weighted_sum(&y, &weights.permute(&[2, 0, 1]).unwrap()).backward().unwrap();

        let f = |t: &Tensor| {
            let y = a.matmul(t).unwrap();
            (&y * &weights).unwrap().sum_all()
        };
        assert_close(&bv.grad().unwrap(), &numeric_grad(f, &b), 1e-2);
    }

    #[test]
    fn test_instance_norm_forward_and_grad() {
        let x = Tensor::from_fn(&[2, 4], |i| ((i * 3 % 5) as f32) - 1.0);
        let weights = Tensor::from_fn(&[2, 4], |i| (i as f32 * 0.7).sin());
        let xv = Variable::leaf(x.clone());
        let y = xv.instance_norm(1e-5).unwrap();

        // zero mean, unit mean-square per row
        for row in y.data().data().chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let ms: f32 = row.iter().map(|v| v * v).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((ms - 1.0).abs() < 1e-3);
        }

        weighted_sum(&y, &weights).backward().unwrap();
        let f = |t: &Tensor| {
            let y = Variable::constant(t.clone()).instance_norm(1e-5).unwrap();
            (&*y.data() * &weights).unwrap().sum_all()
        };
        assert_close(&xv.grad().unwrap(), &numeric_grad(f, &x), 2e-2);
    }

    #[test]
    fn test_masked_softmax() {
        let x = Variable::leaf(Tensor::zeros(&[2, 2]));
        let mask = Tensor::new(vec![1.0, 0.0, 1.0, 1.0], vec![2, 2]).unwrap();
        let y = x.softmax(Some(&mask)).unwrap();
        assert_eq!(y.data().data(), &[1.0, 0.0, 0.5, 0.5]);

        let weights = Tensor::new(vec![1.0, 5.0, 1.0, 3.0], vec![2, 2]).unwrap();
        weighted_sum(&y, &weights).backward().unwrap();
        let g = x.grad().unwrap();
        // fully determined row has zero gradient
        assert_eq!(&g.data()[..2], &[0.0, 0.0]);
        // d/dx0 of (0.5 * 1 + 0.5 * 3) with softmax: p0 * (w0 - mean_w) = 0.5 * (1 - 2)
        assert!((g.data()[2] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_leaky_relu_grad() {
        let x = Variable::leaf(Tensor::new(vec![-1.0, 2.0], vec![2]).unwrap());
        let y = x.leaky_relu(0.1);
        assert_eq!(y.data().data(), &[-0.1, 2.0]);
        y.sum_all().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[0.1, 1.0]);
    }

    #[test]
    fn test_depthwise_conv_causal_and_grad() {
        let x = Tensor::from_fn(&[1, 4, 1, 2], |i| i as f32 + 1.0);
        let w = Tensor::from_fn(&[1, 2, 2], |i| (i as f32 + 1.0) * 0.5);
        let xv = Variable::leaf(x.clone());
        let wv = Variable::leaf(w.clone());
        let y = xv.causal_depthwise_conv(&wv).unwrap();

        // position 0 only sees itself through the last tap
        assert_eq!(y.data().get(&[0, 0, 0, 0]).unwrap(), 1.0 * 1.0);

        let weights = Tensor::from_fn(&[1, 4, 1, 2], |i| (i as f32).cos());
        weighted_sum(&y, &weights).backward().unwrap();
        let fx = |t: &Tensor| {
            let y = Variable::constant(t.clone())
                .causal_depthwise_conv(&Variable::constant(w.clone()))
                .unwrap();
            (&*y.data() * &weights).unwrap().sum_all()
        };
        let fw = |t: &Tensor| {
            let y = Variable::constant(x.clone())
                .causal_depthwise_conv(&Variable::constant(t.clone()))
                .unwrap();
            (&*y.data() * &weights).unwrap().sum_all()
        };
        assert_close(&xv.grad().unwrap(), &numeric_grad(fx, &x), 1e-2);
        assert_close(&wv.grad().unwrap(), &numeric_grad(fw, &w), 5e-2);
    }

    #[test]
    fn test_cross_entropy_uniform() {
        let logits = Variable::leaf(Tensor::zeros(&[2, 4]));
        let loss = logits.cross_entropy(&[1, 3], 0.0).unwrap();
        for &l in loss.data().data() {
            assert!((l - 4f32.ln()).abs() < 1e-6);
        }
        loss.sum_all().backward().unwrap();
        let g = logits.grad().unwrap();
        assert!((g.data()[1] + 0.75).abs() < 1e-6);
        assert!((g.data()[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_router_softmax_z_loss_gradient() {
        let x = Tensor::from_fn(&[3, 2], |i| (i as f32 * 0.9).sin() * 2.0);
        let weights = Tensor::from_fn(&[3, 2], |i| i as f32 * 0.25 - 0.5);
        let z_loss = 0.3;

        let plain = Variable::leaf(x.clone());
        weighted_sum(&plain.router_softmax(0.0).unwrap(), &weights).backward().unwrap();
        let soft = Variable::leaf(x.clone());
        weighted_sum(&soft.softmax(None).unwrap(), &weights).backward().unwrap();
        assert_close(&plain.grad().unwrap(), &soft.grad().unwrap(), 1e-6);

        // the backward pass follows sum(w * p) + z * mean(lse^2) + z * sum(p^2) / (2 * size)
        let xv = Variable::leaf(x.clone());
        let y = xv.router_softmax(z_loss).unwrap();
        assert_close(&y.data(), &Variable::constant(x.clone()).softmax(None).unwrap().data(), 1e-6);
        weighted_sum(&y, &weights).backward().unwrap();
        let f = |t: &Tensor| {
            let mut total = 0.0;
            for (r, row) in t.data().chunks(2).enumerate() {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let lse = max + row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
                total += z_loss * lse * lse / 3.0;
                for (e, v) in row.iter().enumerate() {
                    let p = (v - lse).exp();
                    total += weights.data()[r * 2 + e] * p + z_loss * p * p / 12.0;
                }
            }
            total
        };
        assert_close(&xv.grad().unwrap(), &numeric_grad(f, &x), 1e-2);
    }

    #[test]
    fn test_gather_scatter_grads() {
        let table = Variable::leaf(Tensor::from_fn(&[3, 2], |i| i as f32));
        let rows = table.gather_rows(&[0, 0, 2]).unwrap();
        rows.sum_all().backward().unwrap();
        assert_eq!(table.grad().unwrap().data(), &[2.0, 2.0, 0.0, 0.0, 1.0, 1.0]);

        let src = Variable::leaf(Tensor::ones(&[2, 2]));
        let placed = src.scatter_rows(&[2, 0], 3).unwrap();
        assert_eq!(placed.data().data(), &[1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
    }
}
