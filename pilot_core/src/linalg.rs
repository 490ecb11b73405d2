//! Dense matrix kernel used by the estimator and the polynomial solvers.
//!
//! Storage and the basic algebra (add, multiply, transpose) come from
//! nalgebra's `DMatrix`/`DVector`. This module adds what the filters need
//! on top: an inverse that refuses numerically singular input instead of
//! returning garbage, and a few covariance helpers. Keeping these here lets
//! the tracking code stay independent of the decomposition choice.

use nalgebra::{DMatrix, DVector};

/// Reciprocal condition estimate below which a matrix is treated as singular.
pub const SINGULAR_RCOND: f64 = 1e-12;

/// Tolerance used when deciding whether the Cholesky fast path applies.
const SYMMETRY_TOL: f64 = 1e-9;

/// Errors from the matrix kernel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinalgError {
    #[error("matrix is not square: {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },

    #[error("matrix contains non-finite entries")]
    NonFinite,

    #[error("matrix is numerically singular (rcond = {rcond:e})")]
    Singular { rcond: f64 },
}

/// Cheap reciprocal condition estimate from the diagonal of a full-pivot LU.
///
/// Returns a value in `[0, 1]`; 0 means exactly singular.
pub fn reciprocal_condition(m: &DMatrix<f64>) -> f64 {
    let n = m.nrows().min(m.ncols());
    if n == 0 {
        return 0.0;
    }

    let u = m.clone().full_piv_lu().u();
    let mut min = f64::INFINITY;
    let mut max = 0.0_f64;
    for i in 0..n {
        let d = u[(i, i)].abs();
        min = min.min(d);
        max = max.max(d);
    }

    if max == 0.0 {
        0.0
    } else {
        min / max
    }
}

/// Invert a square matrix.
///
/// Symmetric positive-definite input (every covariance in this crate) takes
/// the Cholesky path; anything else falls back to full-pivot LU. Matrices
/// whose condition estimate is below [`SINGULAR_RCOND`] are rejected.
pub fn invert(m: &DMatrix<f64>) -> Result<DMatrix<f64>, LinalgError> {
    if !m.is_square() {
        return Err(LinalgError::NotSquare {
            rows: m.nrows(),
            cols: m.ncols(),
        });
    }
    if m.iter().any(|v| !v.is_finite()) {
        return Err(LinalgError::NonFinite);
    }
    if m.nrows() == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }

    let rcond = reciprocal_condition(m);
    if rcond < SINGULAR_RCOND {
        return Err(LinalgError::Singular { rcond });
    }

    if is_symmetric(m, SYMMETRY_TOL) {
        if let Some(chol) = m.clone().cholesky() {
            return Ok(chol.inverse());
        }
    }

    m.clone()
        .full_piv_lu()
        .try_inverse()
        .ok_or(LinalgError::Singular { rcond })
}

/// Solve `A·x = b` through [`invert`].
pub fn solve(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
    Ok(invert(a)? * b)
}

/// True if `m` equals its transpose within `tol` (absolute).
pub fn is_symmetric(m: &DMatrix<f64>, tol: f64) -> bool {
    if !m.is_square() {
        return false;
    }
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            if (m[(i, j)] - m[(j, i)]).abs() > tol {
                return false;
            }
        }
    }
    true
}

/// `(M + Mᵀ) / 2` - removes round-off asymmetry from a covariance.
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Stack square blocks along the diagonal.
pub fn block_diagonal(blocks: &[DMatrix<f64>]) -> DMatrix<f64> {
    let rows: usize = blocks.iter().map(|b| b.nrows()).sum();
    let cols: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut out = DMatrix::zeros(rows, cols);

    let (mut r, mut c) = (0, 0);
    for block in blocks {
        out.view_mut((r, c), (block.nrows(), block.ncols()))
            .copy_from(block);
        r += block.nrows();
        c += block.ncols();
    }
    out
}
