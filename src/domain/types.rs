//! Shared domain types.
//!
//! This module defines:
//!
//! - the facet identifier and the input data matrix (`Facet`, `DataMatrix`, `DataKind`)
//! - tagged configuration variants (`Conditioning`, `SolveMethod`, `MissMethod`, ...)
//! - the run configurations (`AlsConfig`, `SelectionConfig`, `ErrorConfig`)

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::domain::matrix::MaskedMatrix;
use crate::error::AlsError;

/// Largest number of distinct integer values still treated as a rating scale.
pub const MAX_ORDINAL_CATEGORIES: usize = 12;

/// Which side of the data matrix an entity lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facet {
    /// Row entities (facet 0, e.g. persons).
    Rows,
    /// Column entities (facet 1, e.g. items).
    Cols,
}

impl Facet {
    pub const BOTH: [Facet; 2] = [Facet::Rows, Facet::Cols];

    pub fn index(self) -> usize {
        match self {
            Facet::Rows => 0,
            Facet::Cols => 1,
        }
    }

    pub fn other(self) -> Facet {
        match self {
            Facet::Rows => Facet::Cols,
            Facet::Cols => Facet::Rows,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Facet::Rows => "rows",
            Facet::Cols => "cols",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Statistical character of the observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Interval data.
    Continuous,
    /// A rating scale with the listed (sorted) categories.
    Ordinal { categories: Vec<f64> },
    /// 0/1 responses.
    Dichotomous,
}

impl DataKind {
    /// Infer the data kind from the valid cells.
    ///
    /// - only 0 and 1 present: dichotomous
    /// - integers with at most `MAX_ORDINAL_CATEGORIES` distinct values: ordinal
    /// - anything else: continuous
    pub fn infer(cells: &MaskedMatrix) -> DataKind {
        let mut distinct: Vec<f64> = Vec::new();
        for (_, _, v) in cells.iter_valid() {
            if v.fract() != 0.0 {
                return DataKind::Continuous;
            }
            if !distinct.contains(&v) {
                distinct.push(v);
                if distinct.len() > MAX_ORDINAL_CATEGORIES {
                    return DataKind::Continuous;
                }
            }
        }
        if distinct.is_empty() {
            return DataKind::Continuous;
        }
        if distinct.iter().all(|v| *v == 0.0 || *v == 1.0) {
            return DataKind::Dichotomous;
        }
        if distinct.len() < 3 {
            return DataKind::Continuous;
        }
        distinct.sort_by(|a, b| a.total_cmp(b));
        DataKind::Ordinal {
            categories: distinct,
        }
    }

    pub fn is_dichotomous(&self) -> bool {
        matches!(self, DataKind::Dichotomous)
    }

    /// Number of steps between adjacent categories (`categories - 1`).
    ///
    /// `None` for continuous data.
    pub fn steps(&self) -> Option<usize> {
        match self {
            DataKind::Continuous => None,
            DataKind::Ordinal { categories } => Some(categories.len().saturating_sub(1).max(1)),
            DataKind::Dichotomous => Some(1),
        }
    }

    /// Valid observed values, if the scale is discrete.
    pub fn categories(&self) -> Option<Vec<f64>> {
        match self {
            DataKind::Continuous => None,
            DataKind::Ordinal { categories } => Some(categories.clone()),
            DataKind::Dichotomous => Some(vec![0.0, 1.0]),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DataKind::Continuous => "continuous",
            DataKind::Ordinal { .. } => "ordinal",
            DataKind::Dichotomous => "dichotomous",
        }
    }
}

/// Row entities × column entities, with missing cells masked.
///
/// Immutable once built: the engine reads it, never writes it.
#[derive(Debug, Clone)]
pub struct DataMatrix {
    cells: MaskedMatrix,
    row_ids: Vec<String>,
    col_ids: Vec<String>,
    kind: DataKind,
}

impl DataMatrix {
    /// Build a data matrix, inferring its `DataKind`.
    pub fn new(cells: MaskedMatrix, row_ids: Vec<String>, col_ids: Vec<String>) -> Result<Self, AlsError> {
        let kind = DataKind::infer(&cells);
        Self::with_kind(cells, row_ids, col_ids, kind)
    }

    pub fn with_kind(
        cells: MaskedMatrix,
        row_ids: Vec<String>,
        col_ids: Vec<String>,
        kind: DataKind,
    ) -> Result<Self, AlsError> {
        if row_ids.len() != cells.nrows() {
            return Err(AlsError::DimensionMismatch {
                context: "row identifiers".to_string(),
                expected: cells.nrows(),
                got: row_ids.len(),
            });
        }
        if col_ids.len() != cells.ncols() {
            return Err(AlsError::DimensionMismatch {
                context: "column identifiers".to_string(),
                expected: cells.ncols(),
                got: col_ids.len(),
            });
        }
        if cells.nrows() == 0 || cells.ncols() == 0 {
            return Err(AlsError::data("data matrix is empty"));
        }
        Ok(Self {
            cells,
            row_ids,
            col_ids,
            kind,
        })
    }

    /// Convenience constructor with generated identifiers (`R0..`, `C0..`).
    pub fn unlabeled(cells: MaskedMatrix) -> Result<Self, AlsError> {
        let row_ids = (0..cells.nrows()).map(|i| format!("R{i}")).collect();
        let col_ids = (0..cells.ncols()).map(|j| format!("C{j}")).collect();
        Self::new(cells, row_ids, col_ids)
    }

    /// Build from a raw array where `nanval` marks missing cells.
    pub fn from_sentinel(
        values: DMatrix<f64>,
        nanval: f64,
        row_ids: Vec<String>,
        col_ids: Vec<String>,
    ) -> Result<Self, AlsError> {
        Self::new(MaskedMatrix::from_sentinel(values, nanval)?, row_ids, col_ids)
    }

    pub fn cells(&self) -> &MaskedMatrix {
        &self.cells
    }

    pub fn kind(&self) -> &DataKind {
        &self.kind
    }

    pub fn nrows(&self) -> usize {
        self.cells.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.cells.ncols()
    }

    pub fn ids(&self, facet: Facet) -> &[String] {
        match facet {
            Facet::Rows => &self.row_ids,
            Facet::Cols => &self.col_ids,
        }
    }

    pub fn n_entities(&self, facet: Facet) -> usize {
        match facet {
            Facet::Rows => self.nrows(),
            Facet::Cols => self.ncols(),
        }
    }

    /// The cells oriented so that `facet`'s entities are the rows.
    pub fn oriented(&self, facet: Facet) -> MaskedMatrix {
        match facet {
            Facet::Rows => self.cells.clone(),
            Facet::Cols => self.cells.transpose(),
        }
    }

    /// A copy with different cells but the same identifiers and kind.
    ///
    /// Used for pseudo-missing masks and split-half subsets.
    pub fn with_cells(&self, cells: MaskedMatrix) -> Result<Self, AlsError> {
        Self::with_kind(cells, self.row_ids.clone(), self.col_ids.clone(), self.kind.clone())
    }

    /// Restrict to a subset of rows and columns (in the given order).
    pub fn subset(&self, rows: &[usize], cols: &[usize]) -> Result<Self, AlsError> {
        let cells = MaskedMatrix::from_fn(rows.len(), cols.len(), |r, c| {
            self.cells.get(rows[r], cols[c])
        });
        let row_ids = rows.iter().map(|&i| self.row_ids[i].clone()).collect();
        let col_ids = cols.iter().map(|&j| self.col_ids[j].clone()).collect();
        Self::with_kind(cells, row_ids, col_ids, self.kind.clone())
    }
}

/// Target dimensionality: one value, or a range to search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimSpec {
    Fixed(usize),
    Search(Vec<usize>),
}

impl DimSpec {
    pub fn candidates(&self) -> Vec<usize> {
        match self {
            DimSpec::Fixed(n) => vec![*n],
            DimSpec::Search(v) => v.clone(),
        }
    }
}

/// RNG seed for starter coordinates: one seed, or candidates to search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedSpec {
    Fixed(u64),
    Auto(Vec<u64>),
}

impl SeedSpec {
    pub fn candidates(&self) -> Vec<u64> {
        match self {
            SeedSpec::Fixed(s) => vec![*s],
            SeedSpec::Auto(v) => v.clone(),
        }
    }

    /// First candidate; used when a single run is needed before any search.
    pub fn primary(&self) -> u64 {
        match self {
            SeedSpec::Fixed(s) => *s,
            SeedSpec::Auto(v) => v.first().copied().unwrap_or(1),
        }
    }
}

/// How each entity's coordinates are solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SolveMethod {
    /// IRLS for dichotomous data, ordinary least squares otherwise.
    Auto,
    /// (Weighted) ordinary least squares.
    LstSq,
    /// Iteratively reweighted least squares for 0/1 data.
    Irls,
}

impl SolveMethod {
    pub fn resolve(self, kind: &DataKind) -> SolveMethod {
        match self {
            SolveMethod::Auto if kind.is_dichotomous() => SolveMethod::Irls,
            SolveMethod::Auto => SolveMethod::LstSq,
            other => other,
        }
    }
}

/// How missing cells enter each entity's solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MissMethod {
    /// Per-entity reduced design built from observed cells only.
    IgnoreCells,
    /// Missing cells imputed from current estimates; one shared inverse.
    ImputeCells,
}

/// User-supplied conditioning callable.
///
/// Receives the valid (entities × dims) sub-array and must return an array of
/// the same shape.
#[derive(Clone)]
pub struct CustomConditioner(pub Arc<dyn Fn(&DMatrix<f64>) -> DMatrix<f64> + Send + Sync>);

impl CustomConditioner {
    pub fn new(f: impl Fn(&DMatrix<f64>) -> DMatrix<f64> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for CustomConditioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomConditioner(..)")
    }
}

/// Coordinate conditioning applied to one facet after it is solved.
#[derive(Debug, Clone, Default)]
pub enum Conditioning {
    #[default]
    None,
    /// QR-orthonormalize the dimension columns.
    Orthonormal,
    /// Rescale each dimension column to unit standard deviation.
    Std,
    /// Exponentiate a one-dimensional facet to force positivity.
    NonNeg1D,
    /// Collapse every valid entity onto the facet mean.
    AllSame,
    Custom(CustomConditioner),
}

impl Conditioning {
    pub fn is_none(&self) -> bool {
        matches!(self, Conditioning::None)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Conditioning::None => "none",
            Conditioning::Orthonormal => "orthonormal",
            Conditioning::Std => "std",
            Conditioning::NonNeg1D => "nonneg-1d",
            Conditioning::AllSame => "all-same",
            Conditioning::Custom(_) => "custom",
        }
    }
}

/// CLI-facing names for the payload-free conditioning variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConditionKind {
    None,
    Orthonormal,
    Std,
    #[value(name = "nonneg-1d")]
    NonNeg1D,
    #[value(name = "all-same")]
    AllSame,
}

impl From<ConditionKind> for Conditioning {
    fn from(value: ConditionKind) -> Self {
        match value {
            ConditionKind::None => Conditioning::None,
            ConditionKind::Orthonormal => Conditioning::Orthonormal,
            ConditionKind::Std => Conditioning::Std,
            ConditionKind::NonNeg1D => Conditioning::NonNeg1D,
            ConditionKind::AllSame => Conditioning::AllSame,
        }
    }
}

/// Degenerate-solution escape settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JoltSpec {
    /// Pseudo-z threshold above which the facet is perturbed.
    pub sigma: f64,
    /// Noise amplitude relative to the facet's mean distance from the origin.
    pub magnitude: f64,
    /// Pass the noise through the facet's conditioning before adding it.
    pub condition_noise: bool,
}

impl Default for JoltSpec {
    fn default() -> Self {
        Self {
            sigma: 4.0,
            magnitude: 0.5,
            condition_noise: false,
        }
    }
}

/// Configuration of one ALS coordinate estimation.
#[derive(Debug, Clone)]
pub struct AlsConfig {
    pub ndim: DimSpec,
    /// Maximum number of full (rows + cols) cycles.
    pub max_iterations: usize,
    /// Relative RMS coordinate change below which a half-step counts as settled.
    pub stop_when_change: f64,
    pub seed: SeedSpec,
    pub solve_method: SolveMethod,
    pub miss_method: MissMethod,
    /// Conditioning per facet, indexed by `Facet::index()`.
    pub condition: [Conditioning; 2],
    pub jolt: Option<JoltSpec>,
    /// Weight opposing entities by inverse squared distance from the origin.
    pub weight_by_influence: bool,
    /// Also weight by log observation count.
    pub weight_by_observation_count: bool,
    /// Recompute non-banked entities of an anchored facet.
    pub refresh_anchors: bool,
}

impl Default for AlsConfig {
    fn default() -> Self {
        Self {
            ndim: DimSpec::Fixed(2),
            max_iterations: 50,
            stop_when_change: 1e-4,
            seed: SeedSpec::Fixed(1),
            solve_method: SolveMethod::Auto,
            miss_method: MissMethod::IgnoreCells,
            condition: [Conditioning::Orthonormal, Conditioning::None],
            jolt: None,
            weight_by_influence: true,
            weight_by_observation_count: false,
            refresh_anchors: false,
        }
    }
}

impl AlsConfig {
    /// Configuration for a single run at a fixed dimensionality and seed.
    pub fn fixed(&self, ndim: usize, seed: u64) -> AlsConfig {
        AlsConfig {
            ndim: DimSpec::Fixed(ndim),
            seed: SeedSpec::Fixed(seed),
            ..self.clone()
        }
    }

    pub fn conditioning(&self, facet: Facet) -> &Conditioning {
        &self.condition[facet.index()]
    }

    pub fn validate(&self) -> Result<(), AlsError> {
        let dims = self.ndim.candidates();
        if dims.is_empty() {
            return Err(AlsError::config("dimensionality search range is empty"));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(AlsError::config("ndim must be >= 1"));
        }
        if self.seed.candidates().is_empty() {
            return Err(AlsError::config("seed search list is empty"));
        }
        if self.max_iterations == 0 {
            return Err(AlsError::config("max_iterations must be >= 1"));
        }
        if !(self.stop_when_change.is_finite() && self.stop_when_change > 0.0) {
            return Err(AlsError::config(format!(
                "stop_when_change must be finite and > 0, got {}",
                self.stop_when_change
            )));
        }
        if matches!(self.condition[0], Conditioning::Orthonormal)
            && matches!(self.condition[1], Conditioning::Orthonormal)
        {
            return Err(AlsError::config(
                "orthonormal conditioning may be applied to one facet only",
            ));
        }
        if let Some(jolt) = &self.jolt {
            if !(jolt.sigma.is_finite() && jolt.sigma > 0.0) {
                return Err(AlsError::config("jolt sigma must be finite and > 0"));
            }
            if !(jolt.magnitude.is_finite() && jolt.magnitude > 0.0) {
                return Err(AlsError::config("jolt magnitude must be finite and > 0"));
            }
        }
        Ok(())
    }
}

/// How a facet is split into two halves for the stability statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitMethod {
    /// Even indices in one group, odd in the other.
    Alternate,
    /// Seeded random permutation, then halves.
    Random(u64),
}

/// Configuration of the dimensionality/seed search.
#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// Share of valid cells held out as pseudo-missing.
    pub pseudo_missing_fraction: f64,
    pub pseudo_missing_seed: u64,
    pub split: SplitMethod,
    /// Skip the stability statistic (accuracy only).
    pub skip_stability: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            pseudo_missing_fraction: 0.1,
            pseudo_missing_seed: 7,
            split: SplitMethod::Alternate,
            skip_stability: false,
        }
    }
}

impl SelectionConfig {
    pub fn validate(&self) -> Result<(), AlsError> {
        let f = self.pseudo_missing_fraction;
        if !(f.is_finite() && f > 0.0 && f < 1.0) {
            return Err(AlsError::config(format!(
                "pseudo_missing_fraction must be in (0, 1), got {f}"
            )));
        }
        Ok(())
    }
}

/// Standard-error aggregation rule for `obspercell`.
///
/// Both rules are empirical heuristics; neither is assumed more correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ObsPerCellRule {
    /// Use the facet with fewer effective observations (conservative).
    PickMinFac,
    /// Sum the error contributions of both facets.
    CombineFacs,
}

/// How expected absolute residuals are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EarMethod {
    /// Binomial for dichotomous data, log-ALS otherwise.
    Auto,
    /// Separable fit of log squared residuals.
    LogAls,
    /// `sqrt(p(1-p))` from probability estimates.
    Binomial,
}

/// Configuration of the estimate/error derivation.
#[derive(Debug, Clone)]
pub struct ErrorConfig {
    pub obs_rule: ObsPerCellRule,
    pub ear_method: EarMethod,
    /// Use leave-one-out (deletion-corrected) residuals for the EAR fit.
    pub unbias: bool,
    /// EAR floor, relative to the RMS residual.
    pub ear_floor: f64,
    pub max_iterations: usize,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            obs_rule: ObsPerCellRule::CombineFacs,
            ear_method: EarMethod::Auto,
            unbias: true,
            ear_floor: 1e-3,
            max_iterations: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(values: &[f64], nrows: usize, ncols: usize) -> MaskedMatrix {
        MaskedMatrix::complete(DMatrix::from_row_slice(nrows, ncols, values)).unwrap()
    }

    #[test]
    fn infers_data_kinds() {
        assert_eq!(DataKind::infer(&cells(&[0.0, 1.0, 1.0, 0.0], 2, 2)), DataKind::Dichotomous);
        assert_eq!(
            DataKind::infer(&cells(&[1.0, 2.0, 3.0, 2.0], 2, 2)),
            DataKind::Ordinal {
                categories: vec![1.0, 2.0, 3.0]
            }
        );
        assert_eq!(DataKind::infer(&cells(&[0.5, 1.0, 3.0, 2.0], 2, 2)), DataKind::Continuous);
    }

    #[test]
    fn auto_solve_method_picks_irls_for_dichotomous() {
        assert_eq!(SolveMethod::Auto.resolve(&DataKind::Dichotomous), SolveMethod::Irls);
        assert_eq!(SolveMethod::Auto.resolve(&DataKind::Continuous), SolveMethod::LstSq);
        assert_eq!(SolveMethod::LstSq.resolve(&DataKind::Dichotomous), SolveMethod::LstSq);
    }

    #[test]
    fn rejects_orthonormal_on_both_facets() {
        let config = AlsConfig {
            condition: [Conditioning::Orthonormal, Conditioning::Orthonormal],
            ..AlsConfig::default()
        };
        assert!(matches!(config.validate(), Err(AlsError::Config(_))));
        assert!(AlsConfig::default().validate().is_ok());
    }

    #[test]
    fn subset_keeps_identifiers_aligned() {
        let data = DataMatrix::unlabeled(cells(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3)).unwrap();
        let sub = data.subset(&[1], &[2, 0]).unwrap();
        assert_eq!(sub.ids(Facet::Rows), &["R1".to_string()]);
        assert_eq!(sub.ids(Facet::Cols), &["C2".to_string(), "C0".to_string()]);
        assert_eq!(sub.cells().get(0, 0), Some(6.0));
        assert_eq!(sub.cells().get(0, 1), Some(4.0));
    }
}
