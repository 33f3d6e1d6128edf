use crate::{KernelError, LinalgElem, Result};

/// Eigendecomposition of a symmetric `n x n` matrix by cyclic Jacobi rotations.
///
/// Returns `(eigenvalues, eigenvectors)` where column `j` of the row-major
/// `eigenvectors` matrix pairs with `eigenvalues[j]`. Eigenvalues are not sorted.
///
/// Jacobi is slow (`O(n^3)` per sweep) but unconditionally stable, which is what
/// a fallback path needs. Sweeps stop once the off-diagonal mass falls below
/// `tolerance` relative to the Frobenius norm, or after `max_sweeps`.
pub fn cpu_eigh<T>(data: &[T], n: usize, max_sweeps: usize, tolerance: T) -> Result<(Vec<T>, Vec<T>)>
where
    T: LinalgElem,
{
    if data.len() != n * n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![n, n],
            got: vec![data.len()],
        });
    }

    let mut a = data.to_vec();
    let mut v = vec![T::zero(); n * n];
    for i in 0..n {
        v[i * n + i] = T::one();
    }

    let two = T::one() + T::one();
    let total = a.iter().fold(T::zero(), |acc, &x| acc + x * x);

    for _ in 0..max_sweeps {
        let mut off = T::zero();
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[p * n + q] * a[p * n + q];
            }
        }
        if off <= tolerance * tolerance * total || off == T::zero() {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p * n + q];
                if apq == T::zero() {
                    continue;
                }
                let app = a[p * n + p];
                let aqq = a[q * n + q];
                let theta = (aqq - app) / (two * apq);
                let sign = if theta >= T::zero() { T::one() } else { -T::one() };
                let t = sign / (theta.abs() + (theta * theta + T::one()).sqrt());
                let c = T::one() / (t * t + T::one()).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[k * n + p];
                    let akq = a[k * n + q];
                    a[k * n + p] = c * akp - s * akq;
                    a[k * n + q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p * n + k];
                    let aqk = a[q * n + k];
                    a[p * n + k] = c * apk - s * aqk;
                    a[q * n + k] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[k * n + p];
                    let vkq = v[k * n + q];
                    v[k * n + p] = c * vkp - s * vkq;
                    v[k * n + q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let values = (0..n).map(|i| a[i * n + i]).collect();
    Ok((values, v))
}
