//! Domain layer types and invariants.

pub mod error;
pub mod feature;
pub mod layer;
pub mod policy;
pub mod progress;
