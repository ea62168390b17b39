//! Command-line parsing for the ALS measurement engine.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the engine code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::data::SampleKind;
use crate::domain::{ConditionKind, EarMethod, MissMethod, ObsPerCellRule, SolveMethod};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "alsm", version, about = "Alternating least squares measurement engine")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Cancel the analysis after this many seconds (exit code 130).
    #[arg(long, value_name = "SECS", global = true)]
    pub time_limit: Option<f64>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decompose a synthetic matrix at one dimensionality and print fit statistics.
    Fit(FitArgs),
    /// Sweep dimensionalities and seeds and print the objectivity table.
    Dims(DimsArgs),
}

/// Synthetic data generator options.
#[derive(Debug, Args, Clone)]
pub struct SampleArgs {
    /// Number of row entities.
    #[arg(long, default_value_t = 100)]
    pub rows: usize,

    /// Number of column entities.
    #[arg(long, default_value_t = 80)]
    pub cols: usize,

    /// Dimensionality of the generating coordinates.
    #[arg(long, default_value_t = 3)]
    pub true_ndim: usize,

    /// SD of the Gaussian noise added to each cell.
    #[arg(long, default_value_t = 0.3)]
    pub noise: f64,

    /// Probability that a cell is missing.
    #[arg(long, default_value_t = 0.05)]
    pub missing: f64,

    /// Scale of the generated cells.
    #[arg(long, value_enum, default_value_t = SampleKind::Continuous)]
    pub kind: SampleKind,

    /// Number of levels for ordinal samples.
    #[arg(long, default_value_t = 5)]
    pub categories: usize,

    /// Random seed for data generation.
    #[arg(long, default_value_t = 1)]
    pub data_seed: u64,
}

/// ALS options shared by `fit` and `dims`.
#[derive(Debug, Args, Clone)]
pub struct AlsArgs {
    /// Maximum full (rows + cols) iterations.
    #[arg(long, default_value_t = 50)]
    pub max_iter: usize,

    /// Relative RMS coordinate change that counts as converged.
    #[arg(long, default_value_t = 1e-4)]
    pub stop_when: f64,

    /// Per-entity solver.
    #[arg(long, value_enum, default_value_t = SolveMethod::Auto)]
    pub solve: SolveMethod,

    /// Missing-cell handling.
    #[arg(long, value_enum, default_value_t = MissMethod::IgnoreCells)]
    pub miss: MissMethod,

    /// Conditioning of the row coordinates.
    #[arg(long, value_enum, default_value_t = ConditionKind::Orthonormal)]
    pub condition_rows: ConditionKind,

    /// Conditioning of the column coordinates.
    #[arg(long, value_enum, default_value_t = ConditionKind::None)]
    pub condition_cols: ConditionKind,

    /// Enable jolting when a facet's pseudo-z exceeds this.
    #[arg(long)]
    pub jolt_sigma: Option<f64>,

    /// Jolt noise amplitude relative to the facet's mean distance.
    #[arg(long, default_value_t = 0.5)]
    pub jolt_magnitude: f64,

    /// Pass jolt noise through the facet's conditioning.
    #[arg(long)]
    pub jolt_condition: bool,

    /// Disable inverse-distance weighting of opposing entities.
    #[arg(long)]
    pub no_influence_weights: bool,

    /// Also weight opposing entities by log observation count.
    #[arg(long)]
    pub count_weights: bool,
}

/// Options for `alsm fit`.
#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    #[command(flatten)]
    pub als: AlsArgs,

    /// Dimensionality of the decomposition.
    #[arg(long, default_value_t = 3)]
    pub ndim: usize,

    /// Seed for the random starter coordinates.
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Standard-error aggregation rule.
    #[arg(long, value_enum, default_value_t = ObsPerCellRule::CombineFacs)]
    pub obs_rule: ObsPerCellRule,

    /// Expected-absolute-residual model.
    #[arg(long, value_enum, default_value_t = EarMethod::Auto)]
    pub ear: EarMethod,

    /// Fit EARs to plain rather than leave-one-out residuals.
    #[arg(long)]
    pub no_unbias: bool,

    /// EAR floor relative to the RMS residual.
    #[arg(long, default_value_t = 1e-3)]
    pub ear_floor: f64,

    /// Dichotomize observations and estimates at this cut before taking residuals.
    #[arg(long)]
    pub ecut: Option<f64>,

    /// Snap estimates to the nearest ordinal category before taking residuals.
    #[arg(long)]
    pub snap: bool,

    /// Show the top-N misfitting cells.
    #[arg(long, default_value_t = 10)]
    pub top: usize,

    /// Anchor bank JSON whose entities are held fixed.
    #[arg(long, value_name = "JSON")]
    pub anchors: Option<PathBuf>,

    /// Recompute non-banked entities of anchored facets.
    #[arg(long)]
    pub refresh_anchors: bool,

    /// Write the final coordinates as an anchor bank.
    #[arg(long = "export-bank", value_name = "JSON")]
    pub export_bank: Option<PathBuf>,

    /// Export per-entity coordinates and statistics to CSV.
    #[arg(long, value_name = "CSV")]
    pub export: Option<PathBuf>,
}

/// How `dims` splits entities for the stability statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SplitKind {
    Alternate,
    Random,
}

/// Options for `alsm dims`.
#[derive(Debug, Args, Clone)]
pub struct DimsArgs {
    #[command(flatten)]
    pub sample: SampleArgs,

    #[command(flatten)]
    pub als: AlsArgs,

    /// Dimensionalities to try (comma separated).
    #[arg(long, value_delimiter = ',', default_value = "1,2,3,4,5")]
    pub search: Vec<usize>,

    /// Starter seeds to try (comma separated).
    #[arg(long, value_delimiter = ',', default_value = "1")]
    pub seeds: Vec<u64>,

    /// Share of observed cells held out for the accuracy statistic.
    #[arg(long, default_value_t = 0.1)]
    pub pseudo_missing: f64,

    /// Seed for choosing pseudo-missing cells.
    #[arg(long, default_value_t = 7)]
    pub pseudo_missing_seed: u64,

    /// Stability split.
    #[arg(long, value_enum, default_value_t = SplitKind::Alternate)]
    pub split: SplitKind,

    /// Seed for `--split random`.
    #[arg(long, default_value_t = 11)]
    pub split_seed: u64,

    /// Score by accuracy alone.
    #[arg(long)]
    pub skip_stability: bool,
}
