//! Weighted normal equations and least-squares helpers.
//!
//! Every coordinate solve in the engine is a small weighted regression of the
//! form
//!
//! ```text
//! minimize Σ w_i (x_i - u_i · v)^2
//! ```
//!
//! where `u_i` are the (fixed) opposing-facet coordinates, `x_i` the observed
//! cells and `v` the unknown coordinates of one entity. The number of unknowns
//! is the dimensionality (typically 1–10), so we form `UᵗWU` explicitly and
//! invert it via Cholesky.
//!
//! Orientation: `U` is always entities × dimensions. Callers transpose at the
//! boundary instead of threading an orientation flag.

use nalgebra::{DMatrix, DVector};

use crate::error::AlsError;

/// Reciprocal-condition floor (on the squared Cholesky diagonal ratio) below
/// which `UᵗWU` is treated as singular.
const RCOND_FLOOR: f64 = 1e-12;

/// Hat values at or above this are treated as full leverage.
const FULL_LEVERAGE: f64 = 1.0 - 1e-9;

/// Compute `(UᵗWU)⁻¹`.
///
/// Returns `None` if the matrix is singular or too ill-conditioned to invert.
/// `weights`, when given, must have one positive entry per row of `u`.
pub fn inv_utu(u: &DMatrix<f64>, weights: Option<&[f64]>) -> Option<DMatrix<f64>> {
    if u.nrows() == 0 || u.ncols() == 0 {
        return None;
    }
    let utwu = match weights {
        Some(w) => {
            let mut uw = u.clone();
            for (i, &wi) in w.iter().enumerate().take(u.nrows()) {
                let mut row = uw.row_mut(i);
                row *= wi;
            }
            u.transpose() * uw
        }
        None => u.transpose() * u,
    };

    let chol = utwu.cholesky()?;
    let diag = chol.l_dirty().diagonal();
    let max = diag.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let min = diag.iter().fold(f64::INFINITY, |m, v| m.min(v.abs()));
    if !(max.is_finite() && max > 0.0) || (min / max).powi(2) < RCOND_FLOOR {
        return None;
    }

    let inv = chol.inverse();
    if inv.iter().all(|v| v.is_finite()) {
        Some(inv)
    } else {
        None
    }
}

/// Solve the weighted least-squares coefficients `V = (UᵗWU)⁻¹ UᵗWx`.
///
/// - `Ok(None)`: the normal-equation matrix is singular (not an error; the
///   caller marks the entity missing).
/// - `Err(NonFinite)`: the solve produced `inf`/`nan`.
pub fn solve1(
    u: &DMatrix<f64>,
    x: &DVector<f64>,
    weights: Option<&[f64]>,
) -> Result<Option<DVector<f64>>, AlsError> {
    if u.nrows() != x.len() {
        return Err(AlsError::DimensionMismatch {
            context: "least-squares data vector".to_string(),
            expected: u.nrows(),
            got: x.len(),
        });
    }
    let Some(inv) = inv_utu(u, weights) else {
        return Ok(None);
    };
    solve_with_inverse(&inv, u, x, weights).map(Some)
}

/// Solve with a precomputed `(UᵗWU)⁻¹`.
pub fn solve_with_inverse(
    inv: &DMatrix<f64>,
    u: &DMatrix<f64>,
    x: &DVector<f64>,
    weights: Option<&[f64]>,
) -> Result<DVector<f64>, AlsError> {
    let wx = match weights {
        Some(w) => DVector::from_iterator(x.len(), x.iter().zip(w).map(|(xi, wi)| xi * wi)),
        None => x.clone(),
    };
    let v = inv * (u.transpose() * wx);
    if v.iter().all(|c| c.is_finite()) {
        Ok(v)
    } else {
        Err(AlsError::non_finite("least-squares solve"))
    }
}

/// Leverage (hat diagonal) of each row of `u`: `h_i = w_i u_i (UᵗWU)⁻¹ u_iᵗ`.
///
/// Returns `None` if `UᵗWU` is singular.
pub fn h_stat(u: &DMatrix<f64>, weights: Option<&[f64]>) -> Option<Vec<f64>> {
    let inv = inv_utu(u, weights)?;
    Some(h_stat_with_inverse(&inv, u, weights))
}

pub fn h_stat_with_inverse(inv: &DMatrix<f64>, u: &DMatrix<f64>, weights: Option<&[f64]>) -> Vec<f64> {
    (0..u.nrows())
        .map(|i| {
            let ui = u.row(i);
            let w = weights.map_or(1.0, |w| w[i]);
            w * (ui * inv * ui.transpose())[(0, 0)]
        })
        .collect()
}

/// Leave-one-out estimate of a cell.
///
/// Given the observed value, the in-sample estimate and the cell's leverage,
/// returns the estimate the model would have produced had the cell been
/// excluded from the solve: `x - (x - est) / (1 - h)`.
///
/// `None` when the cell has full leverage (the entity is exactly determined).
pub fn unbias_est(observed: f64, estimate: f64, h: f64) -> Option<f64> {
    if !(h.is_finite() && h < FULL_LEVERAGE) {
        return None;
    }
    let r = observed - estimate;
    Some(observed - r / (1.0 - h))
}

/// Leave-one-out coordinates of an entity.
///
/// `v` are the entity's coordinates solved from all its cells; `u_i`, `w_i`,
/// `r_i` and `h_i` describe the cell being deleted. Uses the rank-one
/// deletion identity `v_(-i) = v - (UᵗWU)⁻¹ u_iᵗ w_i r_i / (1 - h_i)`.
pub fn unbias_coord(
    v: &DVector<f64>,
    inv: &DMatrix<f64>,
    u_i: &DVector<f64>,
    w_i: f64,
    r_i: f64,
    h_i: f64,
) -> Option<DVector<f64>> {
    if !(h_i.is_finite() && h_i < FULL_LEVERAGE) {
        return None;
    }
    let delta = inv * u_i * (w_i * r_i / (1.0 - h_i));
    Some(v - delta)
}
