use crate::{KernelError, LinalgElem, Result};

/// Reduced QR factorization of a tall `rows x cols` matrix via Householder
/// reflections.
///
/// Returns `(q, r)` with `q` of shape `[rows, cols]` (orthonormal columns) and
/// `r` of shape `[cols, cols]` (upper triangular), both row-major. The signs of
/// `diag(r)` are whatever the reflections produce; callers that need a unique
/// factorization normalize them.
pub fn cpu_qr<T>(data: &[T], rows: usize, cols: usize) -> Result<(Vec<T>, Vec<T>)>
where
    T: LinalgElem,
{
    if data.len() != rows * cols {
        return Err(KernelError::ShapeMismatch {
            expected: vec![rows * cols],
            got: vec![data.len()],
        });
    }
    if rows < cols {
        return Err(KernelError::NotTall { rows, cols });
    }

    let two = T::one() + T::one();
    let mut work = data.to_vec();
    let mut reflectors: Vec<Option<Vec<T>>> = Vec::with_capacity(cols);

    for k in 0..cols {
        let mut v: Vec<T> = (k..rows).map(|i| work[i * cols + k]).collect();
        let norm = v.iter().fold(T::zero(), |acc, &x| acc + x * x).sqrt();
        if norm == T::zero() {
            reflectors.push(None);
            continue;
        }
        let alpha = if v[0] >= T::zero() { -norm } else { norm };
        v[0] -= alpha;
        let v_norm = v.iter().fold(T::zero(), |acc, &x| acc + x * x).sqrt();
        if v_norm == T::zero() {
            reflectors.push(None);
            continue;
        }
        v.iter_mut().for_each(|x| *x /= v_norm);

        // H = I - 2 v v^T applied to the trailing block.
        for j in k..cols {
            let dot = v
                .iter()
                .enumerate()
                .fold(T::zero(), |acc, (i, &vi)| acc + vi * work[(k + i) * cols + j]);
            for (i, &vi) in v.iter().enumerate() {
                work[(k + i) * cols + j] -= two * vi * dot;
            }
        }
        reflectors.push(Some(v));
    }

    let mut r = vec![T::zero(); cols * cols];
    for i in 0..cols {
        for j in i..cols {
            r[i * cols + j] = work[i * cols + j];
        }
    }

    // Q = H_0 H_1 ... H_{n-1} applied to the first `cols` columns of I.
    let mut q = vec![T::zero(); rows * cols];
    for i in 0..cols {
        q[i * cols + i] = T::one();
    }
    for (k, reflector) in reflectors.iter().enumerate().rev() {
        let Some(v) = reflector else { continue };
        for j in 0..cols {
            let dot = v
                .iter()
                .enumerate()
                .fold(T::zero(), |acc, (i, &vi)| acc + vi * q[(k + i) * cols + j]);
            for (i, &vi) in v.iter().enumerate() {
                q[(k + i) * cols + j] -= two * vi * dot;
            }
        }
    }

    Ok((q, r))
}
