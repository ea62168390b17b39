//! Synthetic data generation from known low-rank coordinates.

use clap::ValueEnum;
use nalgebra::DMatrix;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::domain::{Coords, DataKind, DataMatrix, MaskedMatrix};
use crate::error::AlsError;

/// Output scale of generated cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    Continuous,
    /// Quantile-cut into `categories` integer levels `0..categories`.
    Ordinal,
    /// `1` where the noisy value is positive, `0` otherwise.
    Dichotomous,
}

#[derive(Debug, Clone)]
pub struct SampleSpec {
    pub nrows: usize,
    pub ncols: usize,
    pub ndim: usize,
    /// SD of the Gaussian noise added to each cell.
    pub noise: f64,
    /// Probability that a cell is made missing.
    pub missing: f64,
    pub kind: SampleKind,
    /// Used by `SampleKind::Ordinal`.
    pub categories: usize,
    pub seed: u64,
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self {
            nrows: 100,
            ncols: 80,
            ndim: 3,
            noise: 0.0,
            missing: 0.0,
            kind: SampleKind::Continuous,
            categories: 5,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleData {
    pub data: DataMatrix,
    /// Noise-free `R Cᵗ`, every cell present.
    pub truth: DMatrix<f64>,
    pub row_coords: Coords,
    pub col_coords: Coords,
}

pub fn create_data(spec: &SampleSpec) -> Result<SampleData, AlsError> {
    if spec.nrows == 0 || spec.ncols == 0 {
        return Err(AlsError::config("sample must have at least one row and one column"));
    }
    if spec.ndim == 0 {
        return Err(AlsError::config("sample ndim must be >= 1"));
    }
    if !(spec.noise.is_finite() && spec.noise >= 0.0) {
        return Err(AlsError::config(format!("noise must be finite and >= 0, got {}", spec.noise)));
    }
    if !(spec.missing.is_finite() && (0.0..1.0).contains(&spec.missing)) {
        return Err(AlsError::config(format!(
            "missing fraction must be in [0, 1), got {}",
            spec.missing
        )));
    }
    if spec.kind == SampleKind::Ordinal && spec.categories < 3 {
        return Err(AlsError::config("ordinal samples need at least 3 categories"));
    }

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let normal = Normal::new(0.0, 1.0).map_err(|e| AlsError::config(format!("normal distribution: {e}")))?;

    let rows = DMatrix::from_fn(spec.nrows, spec.ndim, |_, _| normal.sample(&mut rng));
    let cols = DMatrix::from_fn(spec.ncols, spec.ndim, |_, _| normal.sample(&mut rng));
    let truth = &rows * cols.transpose();

    let noisy = truth.map(|v| v + spec.noise * normal.sample(&mut rng));
    let observed = match spec.kind {
        SampleKind::Continuous => noisy,
        SampleKind::Ordinal => quantile_cut(&noisy, spec.categories),
        SampleKind::Dichotomous => noisy.map(|v| if v > 0.0 { 1.0 } else { 0.0 }),
    };

    let missing = spec.missing;
    let cells = MaskedMatrix::from_fn(spec.nrows, spec.ncols, |i, j| {
        (!rng.gen_bool(missing)).then_some(observed[(i, j)])
    });

    let kind = match spec.kind {
        SampleKind::Continuous => DataKind::Continuous,
        SampleKind::Ordinal => DataKind::Ordinal {
            categories: (0..spec.categories).map(|c| c as f64).collect(),
        },
        SampleKind::Dichotomous => DataKind::Dichotomous,
    };
    let row_ids = (0..spec.nrows).map(|i| format!("R{i}")).collect();
    let col_ids = (0..spec.ncols).map(|j| format!("C{j}")).collect();
    let data = DataMatrix::with_kind(cells, row_ids, col_ids, kind)?;

    log::debug!(
        "generated {}x{} {} sample (ndim {}, noise {}, missing {:.0}%)",
        spec.nrows,
        spec.ncols,
        data.kind().display_name(),
        spec.ndim,
        spec.noise,
        100.0 * spec.missing
    );

    Ok(SampleData {
        data,
        truth,
        row_coords: Coords::from_matrix(rows)?,
        col_coords: Coords::from_matrix(cols)?,
    })
}

/// Map each value to the number of equal-count quantile thresholds below it.
fn quantile_cut(values: &DMatrix<f64>, categories: usize) -> DMatrix<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let thresholds: Vec<f64> = (1..categories)
        .map(|k| sorted[(k * n / categories).min(n - 1)])
        .collect();
    values.map(|v| thresholds.iter().filter(|t| v >= **t).count() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuous_sample_matches_truth_without_noise() {
        let sample = create_data(&SampleSpec {
            nrows: 10,
            ncols: 8,
            ndim: 2,
            ..SampleSpec::default()
        })
        .unwrap();
        assert_eq!(sample.data.cells().count_valid(), 80);
        assert_eq!(sample.data.cells().get(3, 4), Some(sample.truth[(3, 4)]));
        let rebuilt = sample.row_coords.values() * sample.col_coords.values().transpose();
        assert!((rebuilt - &sample.truth).norm() < 1e-12);
    }

    #[test]
    fn missing_fraction_is_roughly_respected() {
        let sample = create_data(&SampleSpec {
            nrows: 50,
            ncols: 40,
            missing: 0.3,
            ..SampleSpec::default()
        })
        .unwrap();
        let share = 1.0 - sample.data.cells().count_valid() as f64 / 2000.0;
        assert!((share - 0.3).abs() < 0.05, "missing share {share}");
    }

    #[test]
    fn discrete_kinds_use_their_scales() {
        let ordinal = create_data(&SampleSpec {
            kind: SampleKind::Ordinal,
            categories: 4,
            ..SampleSpec::default()
        })
        .unwrap();
        assert_eq!(ordinal.data.kind().steps(), Some(3));
        assert!(
            ordinal
                .data
                .cells()
                .valid_values()
                .iter()
                .all(|v| [0.0, 1.0, 2.0, 3.0].contains(v))
        );

        let binary = create_data(&SampleSpec {
            kind: SampleKind::Dichotomous,
            noise: 0.5,
            ..SampleSpec::default()
        })
        .unwrap();
        assert!(binary.data.kind().is_dichotomous());
        let ones = binary.data.cells().valid_values().iter().filter(|v| **v == 1.0).count();
        assert!(ones > 1000 && ones < 7000);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let bad = SampleSpec {
            missing: 1.0,
            ..SampleSpec::default()
        };
        assert!(matches!(create_data(&bad), Err(AlsError::Config(_))));
    }
}
