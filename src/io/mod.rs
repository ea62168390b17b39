//! Input/output helpers.
//!
//! - anchor bank JSON read/write (`anchor`)
//! - per-entity result exports (CSV) (`export`)

pub mod anchor;
pub mod export;

pub use anchor::*;
pub use export::*;
