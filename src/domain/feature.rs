//! Features: one geometry plus its attributes.

use std::fmt;

use geo::Geometry;
use serde_json::{Map, Value};

/// Stable identifier used to order features across requests.
///
/// Index-based ids sort before named ids; within a variant the natural order applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureId {
    Index(u64),
    Named(String),
}

impl FeatureId {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Index(index) => Value::from(*index),
            Self::Named(name) => Value::from(name.as_str()),
        }
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: FeatureId,
    pub geometry: Geometry<f64>,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(id: FeatureId, geometry: Geometry<f64>, properties: Map<String, Value>) -> Self {
        Self {
            id,
            geometry,
            properties,
        }
    }
}
