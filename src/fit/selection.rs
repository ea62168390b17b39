//! Dimensionality and seed selection by objectivity.
//!
//! Each (ndim, seed) candidate is scored with:
//! - accuracy: prediction of held-out cells
//! - stability: agreement of test-half rows solved from disjoint column groups
//!
//! Objectivity is their geometric mean, `exp((ln acc + ln stab) / 2)`, or
//! whichever one is available. Selection rules:
//! 1. Skip candidates whose statistics cannot be computed (too little data)
//! 2. Choose the maximum objectivity
//! 3. Within `OBJECTIVITY_TIE` of the best, prefer the smaller dimensionality

use rayon::prelude::*;
use serde::Serialize;

use crate::domain::{AlsConfig, DataMatrix, SelectionConfig};
use crate::error::AlsError;
use crate::fit::accuracy::{Accuracy, accuracy};
use crate::fit::cancel::CancelToken;
use crate::fit::stability::{Stability, stability};

/// Objectivity differences below this count as ties.
const OBJECTIVITY_TIE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Candidate {
    /// Position in the sweep; breaks exact ties.
    pub idx: usize,
    pub ndim: usize,
    pub seed: u64,
}

/// Statistics of one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct DimStats {
    pub candidate: Candidate,
    pub accuracy: Option<Accuracy>,
    pub stability: Option<Stability>,
    pub objectivity: f64,
}

/// Output of [`select_dims`].
#[derive(Debug, Clone, Serialize)]
pub struct DimSelection {
    pub best: DimStats,
    /// Every scored candidate, in sweep order.
    pub stats: Vec<DimStats>,
    /// Candidates that could not be scored and why.
    pub skipped: Vec<(Candidate, String)>,
}

/// Every (ndim, seed) pair from the configured search ranges.
pub fn candidates(config: &AlsConfig) -> Vec<Candidate> {
    let seeds = config.seed.candidates();
    config
        .ndim
        .candidates()
        .into_iter()
        .flat_map(|ndim| seeds.iter().map(move |&seed| (ndim, seed)))
        .enumerate()
        .map(|(idx, (ndim, seed))| Candidate { idx, ndim, seed })
        .collect()
}

/// `exp((ln a + ln s) / 2)` when both are present, else the one that is.
pub fn objectivity(accuracy: Option<f64>, stability: Option<f64>) -> Option<f64> {
    match (accuracy, stability) {
        (Some(a), Some(s)) if a > 0.0 && s > 0.0 => Some(((a.ln() + s.ln()) / 2.0).exp()),
        (Some(a), None) => Some(a),
        (None, Some(s)) => Some(s),
        _ => None,
    }
}

/// Score one candidate.
///
/// `Ok(None)` when neither statistic is computable.
pub fn stats_per_dim(
    data: &DataMatrix,
    config: &AlsConfig,
    selection: &SelectionConfig,
    candidate: Candidate,
    cancel: &CancelToken,
) -> Result<Option<DimStats>, AlsError> {
    cancel.check()?;
    let fixed = config.fixed(candidate.ndim, candidate.seed);

    let acc = match accuracy(data, &fixed, selection, cancel) {
        Ok(a) => Some(a),
        Err(e) if is_skippable(&e) => {
            log::warn!("ndim={} seed={}: accuracy skipped: {e}", candidate.ndim, candidate.seed);
            None
        }
        Err(e) => return Err(e),
    };
    let stab = if selection.skip_stability {
        None
    } else {
        match stability(data, &fixed, selection.split, cancel) {
            Ok(s) => s,
            Err(e) if is_skippable(&e) => {
                log::warn!("ndim={} seed={}: stability skipped: {e}", candidate.ndim, candidate.seed);
                None
            }
            Err(e) => return Err(e),
        }
    };

    let Some(obj) = objectivity(
        acc.as_ref().map(|a| a.accuracy),
        stab.as_ref().map(|s| s.stability),
    ) else {
        return Ok(None);
    };

    Ok(Some(DimStats {
        candidate,
        accuracy: acc,
        stability: stab,
        objectivity: obj,
    }))
}

/// Sweep every candidate in parallel and pick the most objective.
pub fn select_dims(
    data: &DataMatrix,
    config: &AlsConfig,
    selection: &SelectionConfig,
    cancel: &CancelToken,
) -> Result<DimSelection, AlsError> {
    config.validate()?;
    selection.validate()?;
    let grid = candidates(config);
    log::info!("dimensionality sweep over {} candidates", grid.len());

    let scored: Vec<(Candidate, Result<Option<DimStats>, AlsError>)> = grid
        .par_iter()
        .map(|&c| (c, stats_per_dim(data, config, selection, c, cancel)))
        .collect();

    let mut stats = Vec::new();
    let mut skipped = Vec::new();
    for (c, outcome) in scored {
        match outcome {
            Ok(Some(s)) => stats.push(s),
            Ok(None) => skipped.push((c, "no statistic computable".to_string())),
            Err(e) if is_skippable(&e) => skipped.push((c, e.to_string())),
            Err(e) => return Err(e),
        }
    }

    if stats.is_empty() {
        return Err(AlsError::InsufficientData(
            "no dimensionality candidate could be scored".to_string(),
        ));
    }

    let best = pick_best(&stats).clone();
    log::info!(
        "selected ndim={} seed={} (objectivity {:.4})",
        best.candidate.ndim,
        best.candidate.seed,
        best.objectivity
    );

    Ok(DimSelection {
        best,
        stats,
        skipped,
    })
}

fn is_skippable(e: &AlsError) -> bool {
    matches!(e, AlsError::InsufficientData(_) | AlsError::Condition(_))
}

/// Maximum objectivity; smaller ndim within the tie band; then sweep order.
fn pick_best(stats: &[DimStats]) -> &DimStats {
    let top = stats.iter().fold(f64::NEG_INFINITY, |m, s| m.max(s.objectivity));
    let mut best: Option<&DimStats> = None;
    for s in stats.iter().filter(|s| s.objectivity >= top - OBJECTIVITY_TIE) {
        best = match best {
            None => Some(s),
            Some(b) => {
                let better = s.candidate.ndim < b.candidate.ndim
                    || (s.candidate.ndim == b.candidate.ndim
                        && (s.objectivity > b.objectivity
                            || (s.objectivity == b.objectivity && s.candidate.idx < b.candidate.idx)));
                Some(if better { s } else { b })
            }
        };
    }
    // `stats` is non-empty, so something is within the band.
    best.unwrap_or(&stats[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleSpec, create_data};
    use crate::domain::{DimSpec, SeedSpec};
    use approx::assert_abs_diff_eq;

    fn stat(idx: usize, ndim: usize, objectivity: f64) -> DimStats {
        DimStats {
            candidate: Candidate { idx, ndim, seed: 1 },
            accuracy: None,
            stability: None,
            objectivity,
        }
    }

    #[test]
    fn objectivity_is_geometric_mean() {
        assert_abs_diff_eq!(objectivity(Some(0.81), Some(0.64)).unwrap(), 0.72, epsilon = 1e-12);
        assert_eq!(objectivity(Some(0.5), None), Some(0.5));
        assert_eq!(objectivity(None, None), None);
    }

    #[test]
    fn grid_crosses_dims_and_seeds() {
        let config = AlsConfig {
            ndim: DimSpec::Search(vec![1, 2, 3]),
            seed: SeedSpec::Auto(vec![4, 5]),
            ..AlsConfig::default()
        };
        let grid = candidates(&config);
        assert_eq!(grid.len(), 6);
        assert_eq!(grid[3], Candidate { idx: 3, ndim: 2, seed: 5 });
    }

    #[test]
    fn ties_prefer_fewer_dimensions() {
        let stats = vec![stat(0, 3, 0.9), stat(1, 2, 0.8995), stat(2, 1, 0.7)];
        assert_eq!(pick_best(&stats).candidate.ndim, 2);
        let clear = vec![stat(0, 3, 0.95), stat(1, 2, 0.8)];
        assert_eq!(pick_best(&clear).candidate.ndim, 3);
    }

    #[test]
    fn sweep_finds_generating_dimensionality() {
        let data = create_data(&SampleSpec {
            nrows: 60,
            ncols: 40,
            ndim: 2,
            noise: 0.5,
            seed: 17,
            ..SampleSpec::default()
        })
        .unwrap()
        .data;
        let config = AlsConfig {
            ndim: DimSpec::Search(vec![1, 2, 4]),
            ..AlsConfig::default()
        };
        let selection = select_dims(&data, &config, &SelectionConfig::default(), &CancelToken::new()).unwrap();
        assert_eq!(selection.stats.len() + selection.skipped.len(), 3);
        assert_eq!(selection.best.candidate.ndim, 2);
    }

    #[test]
    fn cancelled_sweep_errors() {
        let data = create_data(&SampleSpec::default()).unwrap().data;
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = select_dims(&data, &AlsConfig::default(), &SelectionConfig::default(), &cancel).unwrap_err();
        assert!(matches!(err, AlsError::Cancelled));
    }
}
