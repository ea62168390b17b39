//! ALS decomposition engine.
//!
//! Responsibilities:
//!
//! - solve one facet's coordinates against the other (`facet`, `irls`)
//! - alternate facets until coordinates settle (`coord`)
//! - condition, weight and jolt coordinates between half-steps
//! - score candidate dimensionalities by objectivity (`accuracy`, `stability`, `selection`)

pub mod accuracy;
pub mod cancel;
pub mod condition;
pub mod coord;
pub mod facet;
pub mod irls;
pub mod jolt;
pub mod selection;
pub mod stability;
pub mod weight;

pub use accuracy::*;
pub use cancel::*;
pub use condition::*;
pub use coord::*;
pub use facet::*;
pub use irls::*;
pub use jolt::*;
pub use selection::*;
pub use stability::*;
pub use weight::*;
