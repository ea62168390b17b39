//! Error types.
//!
//! Three layers, from most local to most systemic:
//!
//! - [`SolveError`]: one entity's solve failed. Recoverable; the entity becomes
//!   missing and a facet-level flag is raised.
//! - [`ConditionError`]: a conditioning transform cannot be applied (for example,
//!   fewer valid entities than dimensions for orthonormalization).
//! - [`AlsError`]: everything that aborts a run (bad configuration, non-finite
//!   arithmetic, cancellation, anchor-bank I/O).

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single entity's coordinate solve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("normal-equation matrix is singular")]
    Singular,

    #[error("insufficient data: {have} usable observations, need at least {need}")]
    InsufficientData { have: usize, need: usize },
}

/// Failure of a conditioning transform.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("orthonormalization is under-determined: {valid} valid entities for {ndim} dimensions")]
    UnderDetermined { valid: usize, ndim: usize },

    #[error("non-negative conditioning requires exactly one dimension, got {ndim}")]
    RequiresOneDimension { ndim: usize },

    #[error("custom conditioner returned a {got_rows}x{got_cols} array, expected {rows}x{cols}")]
    CustomShape {
        rows: usize,
        cols: usize,
        got_rows: usize,
        got_cols: usize,
    },
}

#[derive(Debug, Error)]
pub enum AlsError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    Data(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    #[error("Conditioning failed: {0}")]
    Condition(#[from] ConditionError),

    #[error("Non-finite value produced in {context}")]
    NonFinite { context: String },

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Anchor bank error: {0}")]
    Anchor(String),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl AlsError {
    pub fn config(message: impl Into<String>) -> Self {
        AlsError::Config(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        AlsError::Data(message.into())
    }

    pub fn non_finite(context: impl Into<String>) -> Self {
        AlsError::NonFinite {
            context: context.into(),
        }
    }

    /// Process exit code for the `alsm` binary.
    ///
    /// - 2: invalid configuration or input files
    /// - 3: not enough data to compute what was asked
    /// - 4: numerical failure during computation
    /// - 130: cancelled
    pub fn exit_code(&self) -> u8 {
        match self {
            AlsError::Config(_) | AlsError::Data(_) | AlsError::Anchor(_) => 2,
            AlsError::Io { .. } | AlsError::Json(_) => 2,
            AlsError::InsufficientData(_) | AlsError::Condition(_) => 3,
            AlsError::DimensionMismatch { .. } | AlsError::NonFinite { .. } => 4,
            AlsError::Cancelled => 130,
        }
    }
}

pub type Result<T> = std::result::Result<T, AlsError>;
