//! Cell estimates and residuals.

use crate::domain::{Coords, MaskedMatrix};
use crate::error::AlsError;
use crate::fit::irls::P_MIN;
use crate::math::{h_stat_with_inverse, inv_utu, unbias_est};
use nalgebra::DMatrix;

/// `rows[i] · cols[j]`, or `None` if either entity is missing.
pub fn cell_estimate(rows: &Coords, cols: &Coords, i: usize, j: usize) -> Option<f64> {
    let r = rows.row(i)?;
    let c = cols.row(j)?;
    Some(r.dot(&c))
}

/// Every cell estimate; a cell is missing iff its row or column is.
pub fn estimate(rows: &Coords, cols: &Coords) -> MaskedMatrix {
    let values = rows.values() * cols.values().transpose();
    MaskedMatrix::from_fn(rows.n_entities(), cols.n_entities(), |i, j| {
        (rows.is_valid(i) && cols.is_valid(j)).then(|| values[(i, j)])
    })
}

/// Estimates read as probabilities, clipped to `[0.001, 0.999]`.
pub fn probabilities(estimates: &MaskedMatrix) -> MaskedMatrix {
    estimates.map_valid(|_, _, v| Some(v.clamp(P_MIN, 1.0 - P_MIN)))
}

#[derive(Debug, Clone, Default)]
pub struct ResidualOptions {
    /// Dichotomize observations and estimates at this cut point first.
    pub ecut: Option<f64>,
    /// Snap estimates to the nearest of these values first.
    pub snap: Option<Vec<f64>>,
}

/// `observed − estimate` where both are present.
pub fn residuals(
    observed: &MaskedMatrix,
    estimates: &MaskedMatrix,
    opts: &ResidualOptions,
) -> Result<MaskedMatrix, AlsError> {
    let cut = |v: f64| match opts.ecut {
        Some(c) => {
            if v >= c {
                1.0
            } else {
                0.0
            }
        }
        None => v,
    };
    let snap = |v: f64| match &opts.snap {
        Some(cats) if !cats.is_empty() => nearest(cats, v),
        _ => v,
    };
    observed.zip_valid(estimates, |x, e| Some(cut(x) - cut(snap(e))))
}

fn nearest(categories: &[f64], v: f64) -> f64 {
    categories
        .iter()
        .copied()
        .min_by(|a, b| (a - v).abs().total_cmp(&(b - v).abs()))
        .unwrap_or(v)
}

/// Leave-one-out residuals: each cell's residual against the estimate its row
/// would have produced without that cell, `r / (1 − h)`.
///
/// Leverages come from the unweighted design of each row's observed cells.
/// Cells at full leverage, and rows whose design is singular, keep the plain
/// residual.
pub fn unbiased_residuals(observed: &MaskedMatrix, rows: &Coords, cols: &Coords) -> Result<MaskedMatrix, AlsError> {
    let est = estimate(rows, cols);
    let plain = residuals(observed, &est, &ResidualOptions::default())?;
    let ndim = cols.ndim();
    let mut out = plain.clone();

    for i in (0..observed.nrows()).filter(|&i| rows.is_valid(i)) {
        let cells: Vec<usize> = observed
            .row_index(i)
            .into_iter()
            .filter(|&j| cols.is_valid(j))
            .collect();
        if cells.len() <= ndim {
            continue;
        }
        let u = DMatrix::from_fn(cells.len(), ndim, |r, d| cols.values()[(cells[r], d)]);
        let Some(inv) = inv_utu(&u, None) else { continue };
        let h = h_stat_with_inverse(&inv, &u, None);

        for (r, &j) in cells.iter().enumerate() {
            let (Some(x), Some(e)) = (observed.get(i, j), est.get(i, j)) else {
                continue;
            };
            if let Some(loo) = unbias_est(x, e, h[r]) {
                out.set(i, j, Some(x - loo));
            }
        }
    }
    Ok(out)
}
