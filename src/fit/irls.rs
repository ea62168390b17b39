//! Iteratively reweighted least squares for 0/1 responses.
//!
//! The linear estimate `u · v` is read as a probability through an affine map
//! taking the lowest observed value to 0 and the highest to 1, clipped away
//! from the boundaries. Each pass reweights the
//! cells by the inverse Bernoulli variance `1 / (p (1 - p))`, so cells whose
//! outcome is nearly certain pull less on the solution.

use nalgebra::{DMatrix, DVector};

use crate::domain::MaskedMatrix;
use crate::error::AlsError;
use crate::math::{solve1, std_dev};

/// Probabilities are clipped to `[P_MIN, 1 - P_MIN]`.
pub const P_MIN: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IrlsOptions {
    pub max_iterations: usize,
    /// Stop when the RMS change of the fitted cells, relative to the data SD,
    /// drops below this.
    pub tolerance: f64,
    /// Linear estimate mapped to probability 0.
    pub low: f64,
    /// Linear estimate mapped to probability 1.
    pub high: f64,
}

impl Default for IrlsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tolerance: 1e-4,
            low: 0.0,
            high: 1.0,
        }
    }
}

impl IrlsOptions {
    /// Map the observed range of `cells` onto `[0, 1]`. Data with fewer than
    /// two distinct values keeps the default map.
    pub fn for_cells(cells: &MaskedMatrix) -> Self {
        let values = cells.valid_values();
        let low = values.iter().copied().fold(f64::INFINITY, f64::min);
        let high = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if high - low > f64::EPSILON {
            Self {
                low,
                high,
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }

    /// Probability for a linear estimate.
    pub fn probability(&self, estimate: f64) -> f64 {
        let span = self.high - self.low;
        let p = if span.abs() > f64::EPSILON {
            (estimate - self.low) / span
        } else {
            estimate
        };
        p.clamp(P_MIN, 1.0 - P_MIN)
    }
}

/// IRLS solve of one entity.
///
/// `base_weights` carry the opposing-facet influence weights; the Bernoulli
/// weights multiply them. `Ok(None)` when the weighted normal equations become
/// singular on any pass.
pub fn irls_solve(
    u: &DMatrix<f64>,
    x: &DVector<f64>,
    base_weights: Option<&[f64]>,
    opts: &IrlsOptions,
) -> Result<Option<DVector<f64>>, AlsError> {
    let Some(mut v) = solve1(u, x, base_weights)? else {
        return Ok(None);
    };

    let xs: Vec<f64> = x.iter().copied().collect();
    let scale = match std_dev(&xs) {
        Some(sd) if sd > 0.0 => sd,
        _ => 1.0,
    };
    let n = x.len().max(1) as f64;

    let mut fitted = u * &v;
    for iter in 0..opts.max_iterations {
        let weights: Vec<f64> = fitted
            .iter()
            .enumerate()
            .map(|(i, &est)| {
                let p = opts.probability(est);
                let base = base_weights.map_or(1.0, |w| w[i]);
                base / (p * (1.0 - p))
            })
            .collect();

        let Some(next) = solve1(u, x, Some(&weights))? else {
            return Ok(None);
        };
        let next_fitted = u * &next;
        let change = ((&next_fitted - &fitted).norm_squared() / n).sqrt() / scale;

        v = next;
        fitted = next_fitted;
        if change < opts.tolerance {
            log::trace!("irls converged after {} passes (change {:.2e})", iter + 1, change);
            break;
        }
    }

    Ok(Some(v))
}
