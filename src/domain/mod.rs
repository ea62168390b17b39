//! Domain types used throughout the engine.
//!
//! This module defines:
//!
//! - masked containers for data and coordinates (`MaskedMatrix`, `Coords`)
//! - the input matrix and facet identifiers (`DataMatrix`, `Facet`, `DataKind`)
//! - run configuration (`AlsConfig`, `SelectionConfig`, `ErrorConfig`)

pub mod matrix;
pub mod types;

pub use matrix::*;
pub use types::*;
