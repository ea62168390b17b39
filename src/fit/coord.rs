//! The alternating least squares loop.
//!
//! Starting from random column coordinates, each cycle solves the rows against
//! the columns, then the columns against the rows. After each half-step the
//! solved facet may be jolted (degenerate-geometry escape) and conditioned;
//! the relative coordinate change is logged, and the loop stops once both
//! facets move less than `stop_when_change` in a cycle or the iteration budget
//! runs out.

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;

use crate::domain::{AlsConfig, Conditioning, Coords, DataMatrix, DimSpec, Facet, SolveMethod};
use crate::error::AlsError;
use crate::fit::cancel::CancelToken;
use crate::fit::condition::condcoord;
use crate::fit::facet::{FacetInput, FacetSolve, faccoord};
use crate::fit::irls::IrlsOptions;
use crate::fit::jolt::jolt;
use crate::fit::weight::weight_coord;

/// Fixed coordinates per facet. A valid entity is frozen at its value.
#[derive(Debug, Clone, Default)]
pub struct Anchors {
    facets: [Option<Coords>; 2],
}

impl Anchors {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, facet: Facet, coords: Coords) -> Self {
        self.facets[facet.index()] = Some(coords);
        self
    }

    pub fn get(&self, facet: Facet) -> Option<&Coords> {
        self.facets[facet.index()].as_ref()
    }

    /// At least one entity of `facet` is frozen.
    pub fn is_anchored(&self, facet: Facet) -> bool {
        self.get(facet).is_some_and(|c| c.count_valid() > 0)
    }

    pub fn any(&self) -> bool {
        Facet::BOTH.iter().any(|f| self.is_anchored(*f))
    }

    fn check(&self, data: &DataMatrix, ndim: usize) -> Result<(), AlsError> {
        for facet in Facet::BOTH {
            let Some(c) = self.get(facet) else { continue };
            if c.ndim() != ndim {
                return Err(AlsError::Anchor(format!(
                    "{facet} anchors have {} dimensions, run uses {ndim}",
                    c.ndim()
                )));
            }
            if c.n_entities() != data.n_entities(facet) {
                return Err(AlsError::Anchor(format!(
                    "{facet} anchors cover {} entities, data has {}",
                    c.n_entities(),
                    data.n_entities(facet)
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub iteration: usize,
    pub facet: Facet,
    /// Relative RMS change; `inf` when there was no previous value to compare.
    pub change: f64,
}

/// Per-half-step coordinate changes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvergenceLog {
    records: Vec<ChangeRecord>,
}

impl ConvergenceLog {
    pub fn push(&mut self, iteration: usize, facet: Facet, change: f64) {
        self.records.push(ChangeRecord {
            iteration,
            facet,
            change,
        });
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn half_steps(&self) -> usize {
        self.records.len()
    }

    pub fn last_change(&self, facet: Facet) -> Option<f64> {
        self.records.iter().rev().find(|r| r.facet == facet).map(|r| r.change)
    }

    /// Mean `log10(change_k / change_{k-1})` over successive same-facet
    /// records. Negative values mean the changes are shrinking.
    pub fn speed(&self) -> Option<f64> {
        let mut ratios = Vec::new();
        for facet in Facet::BOTH {
            let changes: Vec<f64> = self
                .records
                .iter()
                .filter(|r| r.facet == facet)
                .map(|r| r.change)
                .filter(|c| c.is_finite() && *c > 0.0)
                .collect();
            ratios.extend(changes.windows(2).map(|w| (w[1] / w[0]).log10()));
        }
        crate::math::mean(&ratios)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConvergenceStatus {
    Converged,
    MaxIterationsReached,
}

/// Warning flags from a facet's final solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FacetWarnings {
    pub solve_failed: bool,
    pub had_dead: bool,
    pub n_failed: usize,
}

impl FacetWarnings {
    fn from_solve(solve: &FacetSolve) -> Self {
        Self {
            solve_failed: solve.solve_failed,
            had_dead: solve.had_dead,
            n_failed: solve.n_failed(),
        }
    }
}

/// Output of [`coord`].
#[derive(Debug, Clone)]
pub struct CoordResult {
    pub ndim: usize,
    pub seed: u64,
    pub coords: [Coords; 2],
    pub log: ConvergenceLog,
    pub status: ConvergenceStatus,
    /// Full cycles run.
    pub iterations: usize,
    pub warnings: [FacetWarnings; 2],
    pub jolts: usize,
    pub anchored: [bool; 2],
}

impl CoordResult {
    pub fn coords(&self, facet: Facet) -> &Coords {
        &self.coords[facet.index()]
    }

    pub fn rows(&self) -> &Coords {
        self.coords(Facet::Rows)
    }

    pub fn cols(&self) -> &Coords {
        self.coords(Facet::Cols)
    }

    pub fn converged(&self) -> bool {
        self.status == ConvergenceStatus::Converged
    }
}

/// Relative RMS change over entities valid in both arrays.
pub fn coord_change(old: &Coords, new: &Coords) -> f64 {
    let mut diff = 0.0;
    let mut norm = 0.0;
    let mut overlap = 0usize;
    for i in 0..new.n_entities() {
        if let (Some(a), Some(b)) = (old.row(i), new.row(i)) {
            diff += (&b - &a).norm_squared();
            norm += b.norm_squared();
            overlap += 1;
        }
    }
    if overlap == 0 {
        return f64::INFINITY;
    }
    if norm > 0.0 {
        (diff / norm).sqrt()
    } else if diff > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Run ALS on `data` at the fixed dimensionality and seed of `config`.
pub fn coord(
    data: &DataMatrix,
    config: &AlsConfig,
    anchors: &Anchors,
    cancel: &CancelToken,
) -> Result<CoordResult, AlsError> {
    config.validate()?;
    let ndim = match &config.ndim {
        DimSpec::Fixed(n) => *n,
        DimSpec::Search(_) => {
            return Err(AlsError::config(
                "coord needs a fixed dimensionality; search ranges go through select_dims",
            ));
        }
    };
    let seed = config.seed.primary();
    anchors.check(data, ndim)?;

    let method = match config.solve_method.resolve(data.kind()) {
        SolveMethod::Irls => SolveMethod::Irls,
        _ => SolveMethod::LstSq,
    };
    let oriented = [data.oriented(Facet::Rows), data.oriented(Facet::Cols)];
    let counts: [Vec<usize>; 2] = [
        (0..data.nrows()).map(|i| data.cells().row_count(i)).collect(),
        (0..data.ncols()).map(|j| data.cells().col_count(j)).collect(),
    ];
    let dead: [Vec<bool>; 2] = [
        counts[0].iter().map(|&c| c < ndim).collect(),
        counts[1].iter().map(|&c| c < ndim).collect(),
    ];
    for facet in Facet::BOTH {
        if dead[facet.index()].iter().all(|d| *d) {
            return Err(AlsError::InsufficientData(format!(
                "no {facet} entity has at least {ndim} observations"
            )));
        }
    }

    let anchored = [anchors.is_anchored(Facet::Rows), anchors.is_anchored(Facet::Cols)];
    let frozen: [Option<Vec<bool>>; 2] = [
        anchors.get(Facet::Rows).map(|c| c.validity().to_vec()),
        anchors.get(Facet::Cols).map(|c| c.validity().to_vec()),
    ];
    // Anchors fix the metric; conditioning would move it.
    let conditioning: [Conditioning; 2] = if anchors.any() {
        [Conditioning::None, Conditioning::None]
    } else {
        config.condition.clone()
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let mut coords = [
        starter(data.nrows(), ndim, &dead[0], anchors.get(Facet::Rows), false, &mut rng)?,
        starter(
            data.ncols(),
            ndim,
            &dead[1],
            anchors.get(Facet::Cols),
            !anchored[1] || config.refresh_anchors,
            &mut rng,
        )?,
    ];

    log::info!(
        "als: {}x{} {} data, ndim={ndim}, seed={seed}, method={:?}, miss={:?}",
        data.nrows(),
        data.ncols(),
        data.kind().display_name(),
        method,
        config.miss_method
    );

    let mut changes = ConvergenceLog::default();
    let mut warnings = [FacetWarnings::default(); 2];
    let mut jolt_flag = false;
    let mut jolts = 0usize;
    let mut status = ConvergenceStatus::MaxIterationsReached;
    let mut iterations = 0usize;

    let irls = IrlsOptions::for_cells(data.cells());

    for iteration in 1..=config.max_iterations {
        iterations = iteration;
        for facet in Facet::BOTH {
            cancel.check()?;
            let k = facet.index();
            let o = facet.other().index();

            if anchored[k] && !config.refresh_anchors {
                changes.push(iteration, facet, 0.0);
                continue;
            }

            let weights = config.weight_by_influence.then(|| {
                let obs = config.weight_by_observation_count.then_some(counts[o].as_slice());
                weight_coord(&coords[o], obs)
            });

            let input = FacetInput {
                target: &coords[k],
                data: &oriented[k],
                opposing: &coords[o],
                weights: weights.as_deref(),
                method,
                miss: config.miss_method,
                dead: &dead[k],
                frozen: frozen[k].as_deref(),
                irls,
                cancel,
            };
            let solve = faccoord(&input, None)?;
            warnings[k] = FacetWarnings::from_solve(&solve);
            let mut new = solve.coords;

            if let Some(spec) = &config.jolt {
                if !anchored[k] {
                    let out = jolt(&new, spec, jolt_flag, &conditioning[k], &mut rng)?;
                    if out.jolted {
                        jolts += 1;
                    }
                    jolt_flag = out.flag;
                    new = out.coords;
                }
            }

            if !conditioning[k].is_none() {
                let c = condcoord(&new, &conditioning[k])?;
                new = c.coords;
                if let Some(t) = c.opposing_transform {
                    coords[o].transform(&t)?;
                }
            }

            let change = coord_change(&coords[k], &new);
            log::debug!("iteration {iteration} {facet}: change {change:.3e}");
            changes.push(iteration, facet, change);
            coords[k] = new;
        }

        let settled = Facet::BOTH
            .iter()
            .all(|f| changes.last_change(*f).is_some_and(|c| c < config.stop_when_change));
        if settled {
            status = ConvergenceStatus::Converged;
            break;
        }
    }

    // A non-linear column transform leaves the rows out of step; refit them.
    if is_nonlinear(&conditioning[1]) && !(anchored[0] && !config.refresh_anchors) {
        cancel.check()?;
        let weights = config.weight_by_influence.then(|| {
            let obs = config.weight_by_observation_count.then_some(counts[1].as_slice());
            weight_coord(&coords[1], obs)
        });
        let input = FacetInput {
            target: &coords[0],
            data: &oriented[0],
            opposing: &coords[1],
            weights: weights.as_deref(),
            method,
            miss: config.miss_method,
            dead: &dead[0],
            frozen: frozen[0].as_deref(),
            irls,
            cancel,
        };
        let solve = faccoord(&input, None)?;
        warnings[0] = FacetWarnings::from_solve(&solve);
        coords[0] = solve.coords;
    }

    match status {
        ConvergenceStatus::Converged => log::info!(
            "als converged after {iterations} iterations ({} half-steps)",
            changes.half_steps()
        ),
        ConvergenceStatus::MaxIterationsReached => log::warn!(
            "als stopped at max_iterations={} without converging (last changes: rows {:?}, cols {:?})",
            config.max_iterations,
            changes.last_change(Facet::Rows),
            changes.last_change(Facet::Cols)
        ),
    }

    Ok(CoordResult {
        ndim,
        seed,
        coords,
        log: changes,
        status,
        iterations,
        warnings,
        jolts,
        anchored,
    })
}

fn is_nonlinear(spec: &Conditioning) -> bool {
    matches!(
        spec,
        Conditioning::NonNeg1D | Conditioning::AllSame | Conditioning::Custom(_)
    )
}

/// Starting coordinates: random normal for live entities when `randomize`,
/// missing otherwise, with any anchors written over the top.
fn starter(
    n: usize,
    ndim: usize,
    dead: &[bool],
    anchors: Option<&Coords>,
    randomize: bool,
    rng: &mut StdRng,
) -> Result<Coords, AlsError> {
    let normal = Normal::new(0.0, 1.0).map_err(|e| AlsError::config(format!("normal distribution: {e}")))?;
    let mut coords = Coords::missing(n, ndim);
    if randomize {
        let values = DMatrix::from_fn(n, ndim, |_, _| normal.sample(rng));
        for i in (0..n).filter(|&i| !dead[i]) {
            let row: Vec<f64> = values.row(i).iter().copied().collect();
            coords.set(i, Some(&row));
        }
    }
    if let Some(a) = anchors {
        for i in a.valid_indices() {
            let row = a.row(i).map(|r| r.iter().copied().collect::<Vec<_>>());
            coords.set(i, row.as_deref());
        }
    }
    Ok(coords)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleKind, SampleSpec, create_data};
    use crate::domain::{JoltSpec, MissMethod};
    use crate::math::pearson;

    fn estimates(result: &CoordResult) -> DMatrix<f64> {
        result.rows().values() * result.cols().values().transpose()
    }

    #[test]
    fn recovers_exact_low_rank_data() {
        let sample = create_data(&SampleSpec {
            nrows: 100,
            ncols: 80,
            ndim: 3,
            ..SampleSpec::default()
        })
        .unwrap();
        let config = AlsConfig {
            ndim: DimSpec::Fixed(3),
            max_iterations: 100,
            stop_when_change: 1e-8,
            ..AlsConfig::default()
        };
        let result = coord(&sample.data, &config, &Anchors::none(), &CancelToken::new()).unwrap();

        let est = estimates(&result);
        let r = pearson(est.as_slice(), sample.truth.as_slice()).unwrap();
        assert!(r > 0.999, "correlation {r}");
        assert_eq!(result.rows().count_valid(), 100);
        assert!(result.log.half_steps() >= 2);
    }

    #[test]
    fn empty_row_stays_missing_without_disturbing_the_rest() {
        let sample = create_data(&SampleSpec {
            nrows: 30,
            ncols: 20,
            ndim: 2,
            seed: 3,
            ..SampleSpec::default()
        })
        .unwrap();
        let mut cells = sample.data.cells().clone();
        for j in 0..20 {
            cells.set(5, j, None);
        }
        let data = sample.data.with_cells(cells).unwrap();
        let config = AlsConfig {
            max_iterations: 100,
            stop_when_change: 1e-7,
            ..AlsConfig::default()
        };
        let result = coord(&data, &config, &Anchors::none(), &CancelToken::new()).unwrap();

        assert!(!result.rows().is_valid(5));
        assert!(result.warnings[0].had_dead);
        assert_eq!(result.rows().count_valid(), 29);
        assert!(result.converged());

        let est = estimates(&result);
        let kept: Vec<usize> = (0..30).filter(|&i| i != 5).collect();
        let e: Vec<f64> = kept.iter().flat_map(|&i| (0..20).map(move |j| (i, j))).map(|(i, j)| est[(i, j)]).collect();
        let t: Vec<f64> = kept
            .iter()
            .flat_map(|&i| (0..20).map(move |j| (i, j)))
            .map(|(i, j)| sample.truth[(i, j)])
            .collect();
        assert!(pearson(&e, &t).unwrap() > 0.999);
    }

    #[test]
    fn orthonormal_rows_after_convergence() {
        let sample = create_data(&SampleSpec {
            nrows: 40,
            ncols: 25,
            ndim: 2,
            noise: 0.2,
            missing: 0.1,
            seed: 9,
            ..SampleSpec::default()
        })
        .unwrap();
        let result = coord(&sample.data, &AlsConfig::default(), &Anchors::none(), &CancelToken::new()).unwrap();
        let sub = result.rows().valid_matrix();
        let gram = sub.transpose() * &sub;
        assert!((gram[(0, 0)] - 1.0).abs() < 1e-8);
        assert!(gram[(0, 1)].abs() < 1e-8);
    }

    #[test]
    fn anchored_columns_are_not_recomputed() {
        let sample = create_data(&SampleSpec {
            nrows: 30,
            ncols: 12,
            ndim: 2,
            noise: 0.1,
            seed: 4,
            ..SampleSpec::default()
        })
        .unwrap();
        let anchors = Anchors::none().with(Facet::Cols, sample.col_coords.clone());
        let result = coord(&sample.data, &AlsConfig::default(), &anchors, &CancelToken::new()).unwrap();

        assert_eq!(result.cols(), &sample.col_coords);
        assert_eq!(result.anchored, [false, true]);
        // Rows solved against the true column coordinates land near the truth.
        let got: Vec<f64> = result.rows().values().column(0).iter().copied().collect();
        let want: Vec<f64> = sample.row_coords.values().column(0).iter().copied().collect();
        let r = pearson(&got, &want).unwrap();
        assert!(r > 0.99, "row recovery {r}");
    }

    #[test]
    fn refresh_recomputes_unbanked_columns() {
        let sample = create_data(&SampleSpec {
            nrows: 40,
            ncols: 12,
            ndim: 2,
            noise: 0.1,
            seed: 6,
            ..SampleSpec::default()
        })
        .unwrap();
        // Bank only the first half of the columns.
        let mut bank = sample.col_coords.clone();
        for j in 6..12 {
            bank.set(j, None);
        }
        let anchors = Anchors::none().with(Facet::Cols, bank.clone());

        let frozen = coord(&sample.data, &AlsConfig::default(), &anchors, &CancelToken::new()).unwrap();
        assert_eq!(frozen.cols().count_valid(), 6);

        let config = AlsConfig {
            refresh_anchors: true,
            ..AlsConfig::default()
        };
        let refreshed = coord(&sample.data, &config, &anchors, &CancelToken::new()).unwrap();
        assert_eq!(refreshed.cols().count_valid(), 12);
        for j in 0..6 {
            assert_eq!(refreshed.cols().row(j), bank.row(j), "banked column {j} moved");
        }
        assert!(refreshed.anchored[1]);
    }

    #[test]
    fn wrong_anchor_dimensionality_is_rejected() {
        let sample = create_data(&SampleSpec {
            nrows: 10,
            ncols: 8,
            ndim: 3,
            ..SampleSpec::default()
        })
        .unwrap();
        let anchors = Anchors::none().with(Facet::Cols, sample.col_coords.clone());
        let err = coord(&sample.data, &AlsConfig::default(), &anchors, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, AlsError::Anchor(_)));
    }

    #[test]
    fn cancellation_stops_the_loop() {
        let sample = create_data(&SampleSpec::default()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = coord(&sample.data, &AlsConfig::default(), &Anchors::none(), &cancel).unwrap_err();
        assert!(matches!(err, AlsError::Cancelled));
    }

    #[test]
    fn imputed_cells_still_give_a_usable_fit() {
        let sample = create_data(&SampleSpec {
            nrows: 40,
            ncols: 30,
            ndim: 2,
            noise: 0.1,
            missing: 0.1,
            seed: 12,
            ..SampleSpec::default()
        })
        .unwrap();
        let config = AlsConfig {
            miss_method: MissMethod::ImputeCells,
            max_iterations: 200,
            ..AlsConfig::default()
        };
        let result = coord(&sample.data, &config, &Anchors::none(), &CancelToken::new()).unwrap();
        let est = estimates(&result);
        let r = pearson(est.as_slice(), sample.truth.as_slice()).unwrap();
        assert!(r > 0.95, "correlation {r}");
    }

    #[test]
    fn untriggered_jolt_leaves_the_run_unchanged() {
        let sample = create_data(&SampleSpec {
            nrows: 20,
            ncols: 15,
            ndim: 2,
            noise: 0.3,
            seed: 8,
            ..SampleSpec::default()
        })
        .unwrap();
        let plain = coord(&sample.data, &AlsConfig::default(), &Anchors::none(), &CancelToken::new()).unwrap();
        let config = AlsConfig {
            jolt: Some(JoltSpec {
                sigma: 1e6,
                ..JoltSpec::default()
            }),
            ..AlsConfig::default()
        };
        let jolted = coord(&sample.data, &config, &Anchors::none(), &CancelToken::new()).unwrap();
        assert_eq!(jolted.jolts, 0);
        assert_eq!(plain.rows(), jolted.rows());
        assert_eq!(plain.cols(), jolted.cols());
    }

    #[test]
    fn dichotomous_data_runs_through_irls() {
        let sample = create_data(&SampleSpec {
            nrows: 40,
            ncols: 30,
            ndim: 1,
            noise: 0.5,
            kind: SampleKind::Dichotomous,
            seed: 5,
            ..SampleSpec::default()
        })
        .unwrap();
        let config = AlsConfig {
            ndim: DimSpec::Fixed(1),
            ..AlsConfig::default()
        };
        let result = coord(&sample.data, &config, &Anchors::none(), &CancelToken::new()).unwrap();
        assert!(result.rows().count_valid() > 0);
        assert!(result.cols().count_valid() > 0);
    }

    #[test]
    fn convergence_log_metrics() {
        let mut changes = ConvergenceLog::default();
        changes.push(1, Facet::Rows, f64::INFINITY);
        changes.push(1, Facet::Cols, 1.0);
        changes.push(2, Facet::Rows, 0.1);
        changes.push(2, Facet::Cols, 0.1);
        changes.push(3, Facet::Rows, 0.01);
        assert_eq!(changes.half_steps(), 5);
        assert_eq!(changes.last_change(Facet::Rows), Some(0.01));
        let speed = changes.speed().unwrap();
        assert!((speed + 1.0).abs() < 1e-12);
    }

    #[test]
    fn change_is_infinite_without_overlap() {
        let a = Coords::missing(3, 2);
        let b = Coords::from_matrix(DMatrix::from_element(3, 2, 1.0)).unwrap();
        assert!(coord_change(&a, &b).is_infinite());
        assert_eq!(coord_change(&b, &b), 0.0);
    }
}
