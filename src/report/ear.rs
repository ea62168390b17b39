//! Expected absolute residuals and standard errors.
//!
//! A single residual is a noisy sample of a cell's error. The expected
//! absolute residual (EAR) smooths it by assuming the squared error separates
//! into a row factor times a column factor:
//!
//! ```text
//! ln r²_ij ≈ a_i + b_j
//! ```
//!
//! That is a two-dimensional ALS problem with row coordinates `[1, a_i]` and
//! column coordinates `[b_j, 1]`. The exponentiated fit lives on the wrong
//! scale (the mean of a log is not the log of a mean), so it is mapped back onto
//! the squared residuals with a degree-1 polynomial before taking the root.
//! The polynomial has no constant term: `r² ≈ c·f`, fitted with weights `1/f`,
//! which gives `c = Σr² / Σf`. A free intercept lets the large squared
//! residuals lift every low-noise cell.

use serde::Serialize;

use crate::domain::{DataKind, EarMethod, ErrorConfig, Facet, MaskedMatrix, ObsPerCellRule};
use crate::error::AlsError;
use crate::math::{mean, mean_square};

/// Stop the log-ALS once no factor moves more than this.
const LOG_ALS_TOL: f64 = 1e-10;

/// `ln(r² + eps)` offset, relative to the mean squared residual.
const LOG_EPS_REL: f64 = 1e-6;

/// Per-cell expected absolute residuals.
///
/// Defined wherever both the row and the column have at least one residual,
/// including cells that were never observed.
pub fn log_als_ear(resid: &MaskedMatrix, config: &ErrorConfig) -> Result<MaskedMatrix, AlsError> {
    let Some(ms) = mean_square(&resid.valid_values()) else {
        return Err(AlsError::InsufficientData("no residuals to model".to_string()));
    };
    let eps = (ms * LOG_EPS_REL).max(f64::MIN_POSITIVE);
    let logs = resid.map_valid(|_, _, r| Some((r * r + eps).ln()));

    let (n, m) = logs.shape();
    let mut row_f: Vec<Option<f64>> = vec![None; n];
    let mut col_f: Vec<Option<f64>> = (0..m).map(|j| mean(&logs.col_values(j))).collect();

    for iter in 0..config.max_iterations.max(1) {
        let mut moved = 0.0_f64;
        for (i, slot) in row_f.iter_mut().enumerate() {
            let next = offset_mean(logs.row_index(i).into_iter().map(|j| (logs.get(i, j), col_f[j])));
            moved = moved.max(delta(*slot, next));
            *slot = next;
        }
        for (j, slot) in col_f.iter_mut().enumerate() {
            let next = offset_mean((0..n).filter(|&i| logs.is_valid(i, j)).map(|i| (logs.get(i, j), row_f[i])));
            moved = moved.max(delta(*slot, next));
            *slot = next;
        }
        if moved < LOG_ALS_TOL {
            log::trace!("log-ALS settled after {} passes", iter + 1);
            break;
        }
    }

    let fitted = MaskedMatrix::from_fn(n, m, |i, j| match (row_f[i], col_f[j]) {
        (Some(a), Some(b)) => Some((a + b).exp()),
        _ => None,
    });

    // Map onto the squared-residual scale.
    let (sum_sq, sum_fit) = resid
        .iter_valid()
        .filter_map(|(i, j, r)| fitted.get(i, j).map(|f| (r * r, f)))
        .fold((0.0, 0.0), |(a, b), (sq, f)| (a + sq, b + f));
    let scale = if sum_fit > 0.0 && sum_fit.is_finite() {
        sum_sq / sum_fit
    } else {
        1.0
    };
    log::trace!("EAR refit scale {scale:.4}");

    let floor = config.ear_floor * ms.sqrt();
    Ok(fitted.map_valid(|_, _, f| Some((scale * f).sqrt().max(floor))))
}

fn offset_mean(terms: impl Iterator<Item = (Option<f64>, Option<f64>)>) -> Option<f64> {
    let diffs: Vec<f64> = terms
        .filter_map(|(y, other)| Some(y? - other?))
        .collect();
    mean(&diffs)
}

fn delta(old: Option<f64>, new: Option<f64>) -> f64 {
    match (old, new) {
        (Some(a), Some(b)) => (a - b).abs(),
        (None, None) => 0.0,
        _ => f64::INFINITY,
    }
}

/// `sqrt(p (1 − p))` from probability estimates.
pub fn binomial_ear(probabilities: &MaskedMatrix) -> MaskedMatrix {
    probabilities.map_valid(|_, _, p| Some((p * (1.0 - p)).sqrt()))
}

/// Per-cell multiplier turning an EAR into a standard error of the estimate.
///
/// Both rules are empirical. `ndim / n` is the share of a facet entity's
/// information spent on its own coordinates; an anchored facet contributes no
/// estimation error.
#[derive(Debug, Clone, Serialize)]
pub struct ObsPerCell {
    pub row_terms: Vec<Option<f64>>,
    pub col_terms: Vec<Option<f64>>,
    pub rule: ObsPerCellRule,
}

impl ObsPerCell {
    pub fn factor(&self, i: usize, j: usize) -> Option<f64> {
        let a = self.row_terms[i]?;
        let b = self.col_terms[j]?;
        Some(match self.rule {
            ObsPerCellRule::PickMinFac => a.max(b).sqrt(),
            ObsPerCellRule::CombineFacs => (a + b).sqrt(),
        })
    }
}

/// Effective observations per entity: rating scales count each observation
/// `sqrt(steps)` times.
pub fn effective_count(n_obs: usize, kind: &DataKind) -> f64 {
    match kind {
        DataKind::Ordinal { .. } => n_obs as f64 * (kind.steps().unwrap_or(1) as f64).sqrt(),
        DataKind::Continuous | DataKind::Dichotomous => n_obs as f64,
    }
}

pub fn obspercell(
    counts: [&[usize]; 2],
    ndim: usize,
    kind: &DataKind,
    anchored: [bool; 2],
    rule: ObsPerCellRule,
) -> ObsPerCell {
    let terms = |facet: Facet| -> Vec<Option<f64>> {
        counts[facet.index()]
            .iter()
            .map(|&n| {
                if anchored[facet.index()] {
                    return Some(0.0);
                }
                let eff = effective_count(n, kind);
                (eff > 0.0).then(|| ndim as f64 / eff)
            })
            .collect()
    };
    ObsPerCell {
        row_terms: terms(Facet::Rows),
        col_terms: terms(Facet::Cols),
        rule,
    }
}

/// EAR surface plus per-cell standard errors.
#[derive(Debug, Clone)]
pub struct ErrorEstimate {
    pub ear: MaskedMatrix,
    pub se: MaskedMatrix,
    pub method: EarMethod,
}

/// Derive EAR and standard errors from residuals (or probabilities for
/// dichotomous data).
pub fn estimate_error(
    resid: &MaskedMatrix,
    probabilities: Option<&MaskedMatrix>,
    kind: &DataKind,
    obs: &ObsPerCell,
    config: &ErrorConfig,
) -> Result<ErrorEstimate, AlsError> {
    let method = match config.ear_method {
        EarMethod::Auto if kind.is_dichotomous() && probabilities.is_some() => EarMethod::Binomial,
        EarMethod::Auto => EarMethod::LogAls,
        other => other,
    };
    let ear = match (method, probabilities) {
        (EarMethod::Binomial, Some(p)) => binomial_ear(p),
        (EarMethod::Binomial, None) => {
            return Err(AlsError::config("binomial EAR needs probability estimates"));
        }
        _ => log_als_ear(resid, config)?,
    };
    let se = ear.map_valid(|i, j, e| obs.factor(i, j).map(|f| e * f));
    Ok(ErrorEstimate { ear, se, method })
}
