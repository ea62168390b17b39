//! Cross-sample reproducibility of the row coordinates.
//!
//! Rows are split into a calibration half and a test half, columns into two
//! groups A and B. The calibration half fixes column coordinates for every
//! column in one common space; the test half is then solved twice, once
//! against the anchored A columns and once against the anchored B columns.
//! If the decomposition is objective, both solves place the test rows in
//! the same spot.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::domain::{AlsConfig, Coords, DataMatrix, Facet, SplitMethod};
use crate::error::AlsError;
use crate::fit::accuracy::{SCORE_CEILING, SCORE_FLOOR};
use crate::fit::cancel::CancelToken;
use crate::fit::coord::{Anchors, coord};
use crate::math::pearson;

#[derive(Debug, Clone, Serialize)]
pub struct Stability {
    pub ndim: usize,
    pub seed: u64,
    /// Correlation of the two test-half solutions, clipped to (0, 1).
    pub stability: f64,
    /// Coordinate values compared.
    pub n_compared: usize,
}

/// Two disjoint groups covering `0..n`.
pub fn split_indices(n: usize, method: SplitMethod) -> (Vec<usize>, Vec<usize>) {
    match method {
        SplitMethod::Alternate => (0..n).partition(|i| i % 2 == 0),
        SplitMethod::Random(seed) => {
            let mut idx: Vec<usize> = (0..n).collect();
            idx.shuffle(&mut StdRng::seed_from_u64(seed));
            let mut second = idx.split_off(n / 2);
            let mut first = idx;
            first.sort_unstable();
            second.sort_unstable();
            (first, second)
        }
    }
}

/// `Ok(None)` when a group is too small for the requested dimensionality.
pub fn stability(
    data: &DataMatrix,
    config: &AlsConfig,
    split: SplitMethod,
    cancel: &CancelToken,
) -> Result<Option<Stability>, AlsError> {
    let ndim = config.ndim.candidates().into_iter().max().unwrap_or(1);
    let (group_a, group_b) = split_indices(data.ncols(), split);
    let row_split = match split {
        SplitMethod::Alternate => SplitMethod::Alternate,
        SplitMethod::Random(seed) => SplitMethod::Random(seed.wrapping_add(1)),
    };
    let (calib_rows, test_rows) = split_indices(data.nrows(), row_split);

    if [&group_a, &group_b, &calib_rows, &test_rows].iter().any(|g| g.len() <= ndim) {
        log::debug!(
            "stability skipped: groups {}/{} cols, {}/{} rows for ndim {ndim}",
            group_a.len(),
            group_b.len(),
            calib_rows.len(),
            test_rows.len()
        );
        return Ok(None);
    }

    let all_cols: Vec<usize> = (0..data.ncols()).collect();
    let calibration = coord(&data.subset(&calib_rows, &all_cols)?, config, &Anchors::none(), cancel)?;
    let col_coords = calibration.cols();

    let mut solutions: Vec<Coords> = Vec::with_capacity(2);
    for group in [&group_a, &group_b] {
        let anchored = restrict(col_coords, group);
        if anchored.count_valid() <= ndim {
            log::debug!("stability skipped: too few calibrated columns in a group");
            return Ok(None);
        }
        let subset = data.subset(&test_rows, group)?;
        let anchors = Anchors::none().with(Facet::Cols, anchored);
        let solved = coord(&subset, config, &anchors, cancel)?;
        solutions.push(solved.rows().clone());
    }

    let (mut x, mut y) = (Vec::new(), Vec::new());
    for i in 0..test_rows.len() {
        if let (Some(a), Some(b)) = (solutions[0].row(i), solutions[1].row(i)) {
            x.extend(a.iter().copied());
            y.extend(b.iter().copied());
        }
    }
    let Some(r) = pearson(&x, &y) else {
        log::warn!("stability: test-half coordinates have no spread to correlate");
        return Ok(None);
    };

    Ok(Some(Stability {
        ndim: calibration.ndim,
        seed: calibration.seed,
        stability: r.clamp(SCORE_FLOOR, SCORE_CEILING),
        n_compared: x.len(),
    }))
}

fn restrict(coords: &Coords, idx: &[usize]) -> Coords {
    let mut out = Coords::missing(idx.len(), coords.ndim());
    for (r, &i) in idx.iter().enumerate() {
        let row = coords.row(i).map(|v| v.iter().copied().collect::<Vec<_>>());
        out.set(r, row.as_deref());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleSpec, create_data};
    use crate::domain::DimSpec;

    #[test]
    fn splits_are_disjoint_and_cover_everything() {
        for method in [SplitMethod::Alternate, SplitMethod::Random(9)] {
            let (a, b) = split_indices(11, method);
            let mut all: Vec<usize> = a.iter().chain(&b).copied().collect();
            all.sort_unstable();
            assert_eq!(all, (0..11).collect::<Vec<_>>());
            assert!(a.len().abs_diff(b.len()) <= 1);
        }
        assert_eq!(split_indices(5, SplitMethod::Alternate).0, vec![0, 2, 4]);
    }

    #[test]
    fn objective_data_is_stable() {
        let data = create_data(&SampleSpec {
            nrows: 60,
            ncols: 40,
            ndim: 2,
            noise: 0.1,
            seed: 6,
            ..SampleSpec::default()
        })
        .unwrap()
        .data;
        let config = AlsConfig {
            ndim: DimSpec::Fixed(2),
            ..AlsConfig::default()
        };
        let s = stability(&data, &config, SplitMethod::Alternate, &CancelToken::new())
            .unwrap()
            .unwrap();
        assert!(s.stability > 0.95, "stability {}", s.stability);
        assert_eq!(s.n_compared, 60);
    }

    #[test]
    fn too_few_columns_gives_none() {
        let data = create_data(&SampleSpec {
            nrows: 20,
            ncols: 6,
            ndim: 2,
            ..SampleSpec::default()
        })
        .unwrap()
        .data;
        let config = AlsConfig {
            ndim: DimSpec::Fixed(3),
            ..AlsConfig::default()
        };
        assert!(
            stability(&data, &config, SplitMethod::Alternate, &CancelToken::new())
                .unwrap()
                .is_none()
        );
    }
}
