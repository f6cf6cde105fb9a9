//! LU factorization with partial pivoting over real and complex scalars.
//!
//! Matrices are stored column-major (`a[i + j * n]`), matching the layout
//! the Jacobian contract hands us, so no transposes happen on the way into
//! the factorization.

use num_complex::Complex;

use crate::Float;

/// Scalar types the dense solver accepts.
pub(crate) trait LinScalar:
    Copy
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
{
    const ZERO: Self;

    /// Magnitude used for pivot selection.
    fn modulus(self) -> Float;
}

impl LinScalar for Float {
    const ZERO: Self = 0.0;

    fn modulus(self) -> Float {
        self.abs()
    }
}

impl LinScalar for Complex<Float> {
    const ZERO: Self = Complex { re: 0.0, im: 0.0 };

    fn modulus(self) -> Float {
        self.norm()
    }
}

/// Marker for a singular (or numerically singular) factorization.
///
/// Surfaced to the step controller as a decomposition failure; the
/// controller halves the stepsize and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Singular;

/// Factor the n-by-n column-major matrix `a` in place as P*A = L*U.
///
/// On success the strict lower triangle of `a` holds L (unit diagonal
/// implied) and the upper triangle holds U; `piv[k]` records the row
/// swapped into position k at elimination step k.
pub(crate) fn lu_factor<T: LinScalar>(
    n: usize,
    a: &mut [T],
    piv: &mut [usize],
) -> Result<(), Singular> {
    debug_assert_eq!(a.len(), n * n);
    debug_assert_eq!(piv.len(), n);

    for k in 0..n {
        // Partial pivoting: largest modulus in column k at or below the diagonal.
        let mut p = k;
        let mut pmag = a[k + k * n].modulus();
        for i in (k + 1)..n {
            let mag = a[i + k * n].modulus();
            if mag > pmag {
                pmag = mag;
                p = i;
            }
        }
        if pmag < Float::MIN_POSITIVE {
            return Err(Singular);
        }
        piv[k] = p;
        if p != k {
            for j in 0..n {
                a.swap(k + j * n, p + j * n);
            }
        }

        // Eliminate below the pivot, storing multipliers in the lower triangle.
        let pivot = a[k + k * n];
        for i in (k + 1)..n {
            a[i + k * n] = a[i + k * n] / pivot;
        }
        for j in (k + 1)..n {
            let u = a[k + j * n];
            for i in (k + 1)..n {
                let l = a[i + k * n];
                a[i + j * n] = a[i + j * n] - l * u;
            }
        }
    }
    Ok(())
}

/// Solve A x = b in place using the packed factors from [`lu_factor`].
pub(crate) fn lu_solve<T: LinScalar>(n: usize, a: &[T], piv: &[usize], b: &mut [T]) {
    debug_assert_eq!(a.len(), n * n);
    debug_assert_eq!(b.len(), n);

    // Apply the row interchanges, then forward substitution with unit L.
    for k in 0..n {
        let p = piv[k];
        if p != k {
            b.swap(k, p);
        }
    }
    for j in 0..n {
        let bj = b[j];
        for i in (j + 1)..n {
            b[i] = b[i] - a[i + j * n] * bj;
        }
    }
    // Back substitution with U.
    for j in (0..n).rev() {
        let bj = b[j] / a[j + j * n];
        b[j] = bj;
        for i in 0..j {
            b[i] = b[i] - a[i + j * n] * bj;
        }
    }
}
