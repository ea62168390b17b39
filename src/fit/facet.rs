//! Per-entity facet solver.
//!
//! Solves every entity of the target facet against the fixed opposing facet.
//! Entities are independent (each has its own subset of observed cells, hence
//! its own design matrix), so the loop runs on the rayon pool.
//!
//! The data passed in is always oriented with the target entities as rows;
//! callers use [`DataMatrix::oriented`](crate::domain::DataMatrix::oriented).

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::domain::{Conditioning, Coords, MaskedMatrix, MissMethod, SolveMethod};
use crate::error::{AlsError, SolveError};
use crate::fit::cancel::CancelToken;
use crate::fit::condition::condcoord;
use crate::fit::irls::{IrlsOptions, irls_solve};
use crate::math::{inv_utu, mean, solve_with_inverse, solve1};

/// What happened to one target entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityOutcome {
    Solved(Vec<f64>),
    /// Frozen by an anchor; previous coordinates kept.
    Kept,
    /// Permanently invalid; left missing without attempting a solve.
    Dead,
    Failed(SolveError),
}

/// Inputs of one facet solve.
#[derive(Debug, Clone, Copy)]
pub struct FacetInput<'a> {
    /// Current target coordinates. Read for frozen entities and for
    /// `ImputeCells` imputation.
    pub target: &'a Coords,
    /// Target entities × opposing entities.
    pub data: &'a MaskedMatrix,
    pub opposing: &'a Coords,
    /// One weight per opposing entity.
    pub weights: Option<&'a [f64]>,
    /// Already resolved (`Auto` is treated as `LstSq`).
    pub method: SolveMethod,
    pub miss: MissMethod,
    pub dead: &'a [bool],
    pub frozen: Option<&'a [bool]>,
    pub irls: IrlsOptions,
    pub cancel: &'a CancelToken,
}

/// Result of [`faccoord`].
#[derive(Debug, Clone)]
pub struct FacetSolve {
    pub coords: Coords,
    pub outcomes: Vec<EntityOutcome>,
    /// At least one entity solve failed.
    pub solve_failed: bool,
    /// At least one entity was already permanently invalid.
    pub had_dead: bool,
    /// Set when a linear conditioning was applied.
    pub opposing_transform: Option<DMatrix<f64>>,
}

impl FacetSolve {
    pub fn failures(&self) -> impl Iterator<Item = (usize, &SolveError)> + '_ {
        self.outcomes.iter().enumerate().filter_map(|(i, o)| match o {
            EntityOutcome::Failed(e) => Some((i, e)),
            _ => None,
        })
    }

    pub fn n_failed(&self) -> usize {
        self.failures().count()
    }
}

/// Shared state for `ImputeCells`: one inverse over every valid opposing entity.
struct Imputation {
    cols: Vec<usize>,
    u: DMatrix<f64>,
    inv: DMatrix<f64>,
    weights: Option<Vec<f64>>,
    fallback: Vec<Option<f64>>,
}

/// Solve every target entity, then optionally condition the result.
pub fn faccoord(input: &FacetInput<'_>, conditioning: Option<&Conditioning>) -> Result<FacetSolve, AlsError> {
    let n = input.data.nrows();
    let ndim = input.opposing.ndim();
    if input.data.ncols() != input.opposing.n_entities() {
        return Err(AlsError::DimensionMismatch {
            context: "opposing coordinates vs data columns".to_string(),
            expected: input.data.ncols(),
            got: input.opposing.n_entities(),
        });
    }
    if input.target.n_entities() != n || input.dead.len() != n {
        return Err(AlsError::DimensionMismatch {
            context: "target entities vs data rows".to_string(),
            expected: n,
            got: input.target.n_entities().min(input.dead.len()),
        });
    }

    let imputation = match (input.miss, input.method) {
        (MissMethod::ImputeCells, SolveMethod::LstSq | SolveMethod::Auto) => prepare_imputation(input),
        _ => None,
    };

    let outcomes: Vec<EntityOutcome> = (0..n)
        .into_par_iter()
        .map(|i| -> Result<EntityOutcome, AlsError> {
            input.cancel.check()?;
            if input.frozen.is_some_and(|f| f[i]) {
                return Ok(EntityOutcome::Kept);
            }
            if input.dead[i] {
                return Ok(EntityOutcome::Dead);
            }
            let solved = match &imputation {
                Some(imp) => solve_imputed(input, imp, i, ndim)?,
                None => solve_ignoring(input, i, ndim)?,
            };
            Ok(match solved {
                Ok(v) => EntityOutcome::Solved(v.iter().copied().collect()),
                Err(e) => EntityOutcome::Failed(e),
            })
        })
        .collect::<Result<_, _>>()?;

    let mut coords = Coords::missing(n, ndim);
    for (i, outcome) in outcomes.iter().enumerate() {
        match outcome {
            EntityOutcome::Solved(v) => coords.set(i, Some(v)),
            EntityOutcome::Kept => {
                let row = input.target.row(i).map(|r| r.iter().copied().collect::<Vec<_>>());
                coords.set(i, row.as_deref());
            }
            EntityOutcome::Dead | EntityOutcome::Failed(_) => {}
        }
    }

    let solve_failed = outcomes.iter().any(|o| matches!(o, EntityOutcome::Failed(_)));
    let had_dead = outcomes.iter().any(|o| matches!(o, EntityOutcome::Dead));
    if solve_failed {
        let n_failed = outcomes
            .iter()
            .filter(|o| matches!(o, EntityOutcome::Failed(_)))
            .count();
        log::warn!("{n_failed} of {n} entity solves failed; those entities are left missing");
    }

    let (coords, opposing_transform) = match conditioning {
        Some(spec) if !spec.is_none() => {
            let c = condcoord(&coords, spec)?;
            (c.coords, c.opposing_transform)
        }
        _ => (coords, None),
    };

    Ok(FacetSolve {
        coords,
        outcomes,
        solve_failed,
        had_dead,
        opposing_transform,
    })
}

/// Reduced design from the entity's observed cells against valid opposing
/// entities.
fn solve_ignoring(
    input: &FacetInput<'_>,
    i: usize,
    ndim: usize,
) -> Result<Result<DVector<f64>, SolveError>, AlsError> {
    let cols: Vec<usize> = input
        .data
        .row_index(i)
        .into_iter()
        .filter(|&j| input.opposing.is_valid(j))
        .collect();
    if cols.len() < ndim {
        return Ok(Err(SolveError::InsufficientData {
            have: cols.len(),
            need: ndim,
        }));
    }

    let u = DMatrix::from_fn(cols.len(), ndim, |r, d| input.opposing.values()[(cols[r], d)]);
    let x = DVector::from_iterator(cols.len(), cols.iter().map(|&j| input.data.values()[(i, j)]));
    let w: Option<Vec<f64>> = input.weights.map(|w| cols.iter().map(|&j| w[j]).collect());

    let v = match input.method {
        SolveMethod::Irls => irls_solve(&u, &x, w.as_deref(), &input.irls)?,
        SolveMethod::LstSq | SolveMethod::Auto => solve1(&u, &x, w.as_deref())?,
    };
    Ok(v.ok_or(SolveError::Singular))
}

fn prepare_imputation(input: &FacetInput<'_>) -> Option<Imputation> {
    let cols = input.opposing.valid_indices();
    let ndim = input.opposing.ndim();
    let u = DMatrix::from_fn(cols.len(), ndim, |r, d| input.opposing.values()[(cols[r], d)]);
    let weights: Option<Vec<f64>> = input.weights.map(|w| cols.iter().map(|&j| w[j]).collect());
    let inv = inv_utu(&u, weights.as_deref())?;
    let fallback = cols.iter().map(|&j| mean(&input.data.col_values(j))).collect();
    Some(Imputation {
        cols,
        u,
        inv,
        weights,
        fallback,
    })
}

/// Full-width design with missing cells imputed from the current estimate.
fn solve_imputed(
    input: &FacetInput<'_>,
    imp: &Imputation,
    i: usize,
    ndim: usize,
) -> Result<Result<DVector<f64>, SolveError>, AlsError> {
    let observed = imp.cols.iter().filter(|&&j| input.data.is_valid(i, j)).count();
    if observed < ndim {
        return Ok(Err(SolveError::InsufficientData {
            have: observed,
            need: ndim,
        }));
    }

    let current = input.target.row(i);
    let x = DVector::from_iterator(
        imp.cols.len(),
        imp.cols.iter().enumerate().map(|(r, &j)| match input.data.get(i, j) {
            Some(v) => v,
            None => match &current {
                Some(row) => row.dot(&imp.u.row(r)),
                None => imp.fallback[r].unwrap_or(0.0),
            },
        }),
    );
    solve_with_inverse(&imp.inv, &imp.u, &x, imp.weights.as_deref()).map(Ok)
}
