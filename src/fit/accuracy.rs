//! Prediction accuracy on held-out cells.
//!
//! A share of the observed cells is hidden, ALS runs on the remainder, and
//! the estimates at the hidden cells are compared with their withheld values.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::domain::{AlsConfig, DataMatrix, MaskedMatrix, SelectionConfig};
use crate::error::AlsError;
use crate::fit::cancel::CancelToken;
use crate::fit::coord::{Anchors, CoordResult, coord};
use crate::math::{mean_square, pearson, rms};
use crate::report::estimate::cell_estimate;

/// Lower clip for correlation-type scores, keeping their logs finite.
pub const SCORE_FLOOR: f64 = 1e-6;

/// Upper clip for correlation-type scores.
pub const SCORE_CEILING: f64 = 1.0 - 1e-12;

/// Fewest held-out cells that still give a meaningful correlation.
const MIN_PSEUDO_MISSING: usize = 3;

/// Cells hidden from one accuracy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoMissing {
    cells: Vec<(usize, usize)>,
}

impl PseudoMissing {
    /// Sample `fraction` of the valid cells, never dropping a row or column
    /// below `min_keep` remaining observations.
    pub fn sample(cells: &MaskedMatrix, fraction: f64, seed: u64, min_keep: usize) -> Self {
        let mut candidates: Vec<(usize, usize)> = cells.iter_valid().map(|(i, j, _)| (i, j)).collect();
        let target = (fraction * candidates.len() as f64).round() as usize;

        let mut rng = StdRng::seed_from_u64(seed);
        candidates.shuffle(&mut rng);

        let mut row_left: Vec<usize> = (0..cells.nrows()).map(|i| cells.row_count(i)).collect();
        let mut col_left: Vec<usize> = (0..cells.ncols()).map(|j| cells.col_count(j)).collect();
        let mut chosen = Vec::with_capacity(target);
        for (i, j) in candidates {
            if chosen.len() >= target {
                break;
            }
            if row_left[i] > min_keep && col_left[j] > min_keep {
                row_left[i] -= 1;
                col_left[j] -= 1;
                chosen.push((i, j));
            }
        }
        chosen.sort_unstable();
        Self { cells: chosen }
    }

    pub fn cells(&self) -> &[(usize, usize)] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// `cells` with the pseudo-missing cells masked out.
    pub fn apply(&self, cells: &MaskedMatrix) -> MaskedMatrix {
        let mut out = cells.clone();
        for &(i, j) in &self.cells {
            out.set(i, j, None);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Accuracy {
    pub ndim: usize,
    pub seed: u64,
    /// Correlation of estimates with withheld values, clipped to (0, 1).
    pub accuracy: f64,
    /// RMS residual at the withheld cells.
    pub rmsr: f64,
    /// `min(r, 1/r)` of mean-square estimates at withheld vs observed cells.
    pub non_degeneracy: Option<f64>,
    pub n_pseudo_missing: usize,
    pub converged: bool,
}

/// Run ALS with pseudo-missing cells and score the held-out predictions.
pub fn accuracy(
    data: &DataMatrix,
    config: &AlsConfig,
    selection: &SelectionConfig,
    cancel: &CancelToken,
) -> Result<Accuracy, AlsError> {
    selection.validate()?;
    let max_dim = config.ndim.candidates().into_iter().max().unwrap_or(1);
    let held = PseudoMissing::sample(
        data.cells(),
        selection.pseudo_missing_fraction,
        selection.pseudo_missing_seed,
        max_dim + 1,
    );
    if held.len() < MIN_PSEUDO_MISSING {
        return Err(AlsError::InsufficientData(format!(
            "only {} cells could be held out for the accuracy check",
            held.len()
        )));
    }

    let masked = data.with_cells(held.apply(data.cells()))?;
    let result = coord(&masked, config, &Anchors::none(), cancel)?;
    score(data, &masked, &held, &result)
}

fn score(
    data: &DataMatrix,
    masked: &DataMatrix,
    held: &PseudoMissing,
    result: &CoordResult,
) -> Result<Accuracy, AlsError> {
    let mut est = Vec::with_capacity(held.len());
    let mut obs = Vec::with_capacity(held.len());
    for &(i, j) in held.cells() {
        if let (Some(e), Some(x)) = (cell_estimate(result.rows(), result.cols(), i, j), data.cells().get(i, j)) {
            est.push(e);
            obs.push(x);
        }
    }
    if est.len() < MIN_PSEUDO_MISSING {
        return Err(AlsError::InsufficientData(
            "too few held-out cells have estimates".to_string(),
        ));
    }

    let accuracy = pearson(&est, &obs)
        .unwrap_or(SCORE_FLOOR)
        .clamp(SCORE_FLOOR, SCORE_CEILING);
    let resid: Vec<f64> = obs.iter().zip(&est).map(|(x, e)| x - e).collect();
    let rmsr = rms(&resid).unwrap_or(0.0);

    let observed_est: Vec<f64> = masked
        .cells()
        .iter_valid()
        .filter_map(|(i, j, _)| cell_estimate(result.rows(), result.cols(), i, j))
        .collect();
    let non_degeneracy = match (mean_square(&est), mean_square(&observed_est)) {
        (Some(a), Some(b)) if a > 0.0 && b > 0.0 => {
            let r = a / b;
            Some(r.min(1.0 / r))
        }
        _ => None,
    };

    log::debug!(
        "accuracy ndim={} seed={}: r={:.4} rmsr={:.4} non_degeneracy={:?}",
        result.ndim,
        result.seed,
        accuracy,
        rmsr,
        non_degeneracy
    );

    Ok(Accuracy {
        ndim: result.ndim,
        seed: result.seed,
        accuracy,
        rmsr,
        non_degeneracy,
        n_pseudo_missing: est.len(),
        converged: result.converged(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleSpec, create_data};
    use crate::domain::DimSpec;

    fn sample(noise: f64, seed: u64) -> DataMatrix {
        create_data(&SampleSpec {
            nrows: 40,
            ncols: 30,
            ndim: 2,
            noise,
            seed,
            ..SampleSpec::default()
        })
        .unwrap()
        .data
    }

    #[test]
    fn pseudo_missing_respects_fraction_and_floors() {
        let data = sample(0.0, 1);
        let held = PseudoMissing::sample(data.cells(), 0.2, 3, 3);
        assert_eq!(held.len(), 240);
        let masked = held.apply(data.cells());
        assert_eq!(masked.count_valid(), 1200 - 240);
        for i in 0..40 {
            assert!(masked.row_count(i) >= 3);
        }
        assert_eq!(held, PseudoMissing::sample(data.cells(), 0.2, 3, 3));
    }

    #[test]
    fn exact_data_predicts_held_out_cells() {
        let data = sample(0.0, 2);
        let config = AlsConfig {
            ndim: DimSpec::Fixed(2),
            max_iterations: 200,
            stop_when_change: 1e-8,
            ..AlsConfig::default()
        };
        let acc = accuracy(&data, &config, &SelectionConfig::default(), &CancelToken::new()).unwrap();
        assert!(acc.accuracy > 0.999, "accuracy {}", acc.accuracy);
        assert!(acc.rmsr < 1e-2);
        assert!(acc.non_degeneracy.unwrap() > 0.5);
    }

    #[test]
    fn less_noise_scores_at_least_as_well_on_average() {
        let config = AlsConfig {
            ndim: DimSpec::Fixed(2),
            ..AlsConfig::default()
        };
        let sel = SelectionConfig::default();
        let cancel = CancelToken::new();
        let mean_acc = |noise: f64| {
            let scores: Vec<f64> = (0..4)
                .map(|s| accuracy(&sample(noise, 20 + s), &config, &sel, &cancel).unwrap().accuracy)
                .collect();
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        let noisy = mean_acc(1.5);
        let mid = mean_acc(0.5);
        let clean = mean_acc(0.05);
        assert!(clean >= mid && mid >= noisy, "{clean} {mid} {noisy}");
    }

    #[test]
    fn scores_stay_inside_unit_interval() {
        let data = sample(3.0, 5);
        let config = AlsConfig {
            ndim: DimSpec::Fixed(2),
            ..AlsConfig::default()
        };
        let acc = accuracy(&data, &config, &SelectionConfig::default(), &CancelToken::new()).unwrap();
        assert!(acc.accuracy > 0.0 && acc.accuracy < 1.0);
    }
}
