//! Fit, separation, reliability and per-entity summaries.

use serde::Serialize;

use crate::domain::{DataMatrix, Facet, MaskedMatrix};
use crate::error::AlsError;
use crate::math::{mean, rms, std_dev};
use crate::report::ear::ErrorEstimate;

/// `|fit|` above this flags a misfitting cell.
pub const MISFIT_THRESHOLD: f64 = 2.0;

/// Standardized residual `resid / EAR`; about 1 in magnitude under a correct model.
pub fn fit(resid: &MaskedMatrix, ear: &MaskedMatrix) -> Result<MaskedMatrix, AlsError> {
    resid.zip_valid(ear, |r, e| (e > 0.0).then(|| r / e))
}

/// Spread of true measures in units of their standard error:
/// `sqrt(max(0, stdev² − sterr²)) / sterr`.
///
/// Infinite when `sterr` is zero.
pub fn separation(stdev: f64, sterr: f64) -> f64 {
    if !(sterr > 0.0) {
        return f64::INFINITY;
    }
    (stdev * stdev - sterr * sterr).max(0.0).sqrt() / sterr
}

/// `sep² / (1 + sep²)`, in `[0, 1]`.
pub fn reliability(separation: f64) -> f64 {
    if separation.is_infinite() {
        return 1.0;
    }
    let s2 = separation * separation;
    (s2 / (1.0 + s2)).clamp(0.0, 1.0)
}

/// RMS of each `facet` entity's valid values.
pub fn rms_per_entity(values: &MaskedMatrix, facet: Facet) -> Vec<Option<f64>> {
    match facet {
        Facet::Rows => (0..values.nrows()).map(|i| rms(&values.row_values(i))).collect(),
        Facet::Cols => (0..values.ncols()).map(|j| rms(&values.col_values(j))).collect(),
    }
}

/// Per-entity RMS residual.
pub fn rmsr(resid: &MaskedMatrix, facet: Facet) -> Vec<Option<f64>> {
    rms_per_entity(resid, facet)
}

/// Per-entity RMS expected absolute residual.
pub fn rmsear(ear: &MaskedMatrix, facet: Facet) -> Vec<Option<f64>> {
    rms_per_entity(ear, facet)
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityStats {
    pub id: String,
    pub n_obs: usize,
    /// Mean cell estimate across the entity.
    pub measure: Option<f64>,
    pub rmsr: Option<f64>,
    pub rmsear: Option<f64>,
    /// RMS of the entity's per-cell standard errors.
    pub se: Option<f64>,
    pub mean_abs_fit: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetStats {
    pub facet: Facet,
    pub entities: Vec<EntityStats>,
    /// SD of the measures.
    pub stdev: Option<f64>,
    /// RMS of the entity standard errors.
    pub sterr: Option<f64>,
    pub separation: Option<f64>,
    pub reliability: Option<f64>,
}

/// Everything one facet's summary needs.
#[derive(Debug, Clone, Copy)]
pub struct FacetInputs<'a> {
    pub data: &'a DataMatrix,
    pub estimates: &'a MaskedMatrix,
    pub resid: &'a MaskedMatrix,
    pub error: &'a ErrorEstimate,
    pub fit: &'a MaskedMatrix,
}

pub fn facet_stats(inputs: &FacetInputs<'_>, facet: Facet) -> FacetStats {
    let oriented = |m: &MaskedMatrix| match facet {
        Facet::Rows => m.clone(),
        Facet::Cols => m.transpose(),
    };
    let cells = inputs.data.oriented(facet);
    let est = oriented(inputs.estimates);
    let fit = oriented(inputs.fit);
    let rmsr = rmsr(inputs.resid, facet);
    let rmsear = rmsear(&inputs.error.ear, facet);
    let se = rms_per_entity(&inputs.error.se, facet);

    let entities: Vec<EntityStats> = inputs
        .data
        .ids(facet)
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let n_obs = cells.row_count(i);
            let abs_fit: Vec<f64> = fit.row_values(i).iter().map(|v| v.abs()).collect();
            EntityStats {
                id: id.clone(),
                n_obs,
                measure: mean(&est.row_values(i)),
                rmsr: rmsr[i],
                rmsear: rmsear[i],
                se: se[i],
                mean_abs_fit: mean(&abs_fit),
            }
        })
        .collect();

    let measures: Vec<f64> = entities.iter().filter_map(|e| e.measure).collect();
    let errors: Vec<f64> = entities.iter().filter_map(|e| e.se).collect();
    let stdev = std_dev(&measures);
    let sterr = rms(&errors);
    let separation = match (stdev, sterr) {
        (Some(sd), Some(se)) => Some(separation(sd, se)),
        _ => None,
    };

    FacetStats {
        facet,
        entities,
        stdev,
        sterr,
        separation,
        reliability: separation.map(reliability),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CellMisfit {
    pub row_id: String,
    pub col_id: String,
    pub observed: f64,
    pub estimate: f64,
    pub fit: f64,
}

/// The `top_n` cells with the largest `|fit|`, largest first.
pub fn top_misfits(data: &DataMatrix, estimates: &MaskedMatrix, fit: &MaskedMatrix, top_n: usize) -> Vec<CellMisfit> {
    let mut cells: Vec<CellMisfit> = fit
        .iter_valid()
        .filter_map(|(i, j, f)| {
            Some(CellMisfit {
                row_id: data.ids(Facet::Rows)[i].clone(),
                col_id: data.ids(Facet::Cols)[j].clone(),
                observed: data.cells().get(i, j)?,
                estimate: estimates.get(i, j)?,
                fit: f,
            })
        })
        .collect();
    cells.sort_by(|a, b| b.fit.abs().total_cmp(&a.fit.abs()));
    cells.truncate(top_n);
    cells
}

/// Share of valid fit values beyond `MISFIT_THRESHOLD`.
pub fn misfit_share(fit: &MaskedMatrix) -> Option<f64> {
    let v = fit.valid_values();
    if v.is_empty() {
        return None;
    }
    Some(v.iter().filter(|f| f.abs() > MISFIT_THRESHOLD).count() as f64 / v.len() as f64)
}
