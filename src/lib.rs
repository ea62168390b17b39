//! `als-measure` library crate.
//!
//! The binary (`alsm`) is a thin wrapper around this library so that:
//!
//! - the engine is testable without spawning processes
//! - modules are reusable from other front-ends
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod report;
