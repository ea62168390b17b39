//! Derived statistics of a finished ALS run.
//!
//! Everything here is computed fresh from the data and the final coordinates;
//! nothing feeds back into the fit.

pub mod ear;
pub mod estimate;
pub mod format;
pub mod stats;

use crate::domain::{DataMatrix, ErrorConfig, Facet, MaskedMatrix};
use crate::error::AlsError;
use crate::fit::CoordResult;
use crate::math::rms;

pub use ear::{ErrorEstimate, ObsPerCell, binomial_ear, estimate_error, log_als_ear, obspercell};
pub use estimate::{ResidualOptions, cell_estimate, estimate, probabilities, residuals, unbiased_residuals};
pub use format::*;
pub use stats::{
    CellMisfit, EntityStats, FacetStats, facet_stats, fit, misfit_share, reliability, rmsear, rmsr, separation,
    top_misfits,
};

/// Estimates, residuals, errors and summaries of one run.
#[derive(Debug, Clone)]
pub struct Report {
    pub estimates: MaskedMatrix,
    /// Clipped probabilities, for dichotomous data.
    pub probabilities: Option<MaskedMatrix>,
    pub residuals: MaskedMatrix,
    pub obs_per_cell: ObsPerCell,
    pub error: ErrorEstimate,
    pub fit: MaskedMatrix,
    pub facets: [FacetStats; 2],
    pub rmsr: Option<f64>,
    pub rmsear: Option<f64>,
    pub misfit_share: Option<f64>,
    pub misfits: Vec<CellMisfit>,
}

impl Report {
    pub fn facet(&self, facet: Facet) -> &FacetStats {
        &self.facets[facet.index()]
    }
}

pub fn analyze(
    data: &DataMatrix,
    result: &CoordResult,
    config: &ErrorConfig,
    residual_opts: &ResidualOptions,
    top_n: usize,
) -> Result<Report, AlsError> {
    let estimates = estimate(result.rows(), result.cols());
    let probabilities = data.kind().is_dichotomous().then(|| probabilities(&estimates));
    let compared = probabilities.as_ref().unwrap_or(&estimates);
    let resid = residuals(data.cells(), compared, residual_opts)?;

    let model_resid = if config.unbias && probabilities.is_none() {
        unbiased_residuals(data.cells(), result.rows(), result.cols())?
    } else {
        resid.clone()
    };

    let counts_rows: Vec<usize> = (0..data.nrows()).map(|i| data.cells().row_count(i)).collect();
    let counts_cols: Vec<usize> = (0..data.ncols()).map(|j| data.cells().col_count(j)).collect();
    let obs = obspercell(
        [&counts_rows, &counts_cols],
        result.ndim,
        data.kind(),
        result.anchored,
        config.obs_rule,
    );
    let error = estimate_error(&model_resid, probabilities.as_ref(), data.kind(), &obs, config)?;
    let fit = fit(&resid, &error.ear)?;

    let inputs = stats::FacetInputs {
        data,
        estimates: compared,
        resid: &resid,
        error: &error,
        fit: &fit,
    };
    let facets = [facet_stats(&inputs, Facet::Rows), facet_stats(&inputs, Facet::Cols)];
    for f in &facets {
        log::info!(
            "{}: separation {:?}, reliability {:?}",
            f.facet,
            f.separation,
            f.reliability
        );
    }

    Ok(Report {
        rmsr: rms(&resid.valid_values()),
        rmsear: rms(&error.ear.valid_values()),
        misfit_share: misfit_share(&fit),
        misfits: top_misfits(data, compared, &fit, top_n),
        estimates,
        probabilities,
        residuals: resid,
        obs_per_cell: obs,
        error,
        fit,
        facets,
    })
}
