//! Input data sources.
//!
//! Loaders for external formats are out of scope; the binary and the tests
//! work from synthetic matrices with known generating coordinates.

pub mod sample;

pub use sample::*;
