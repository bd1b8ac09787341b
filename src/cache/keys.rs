//! Cache key definitions.

use std::{fmt, time::Duration};

use sha2::{Digest, Sha256};

use crate::domain::{layer::LayerId, policy::RenderPolicy};
use crate::geometry::BoundingBox;

/// Identifies one generated payload: a layer rendered under one policy and viewport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub layer_id: LayerId,
    tolerance_bits: u64,
    pub max_features: usize,
    /// Canonical `minx,miny,maxx,maxy`, or `None` for the whole layer.
    pub bbox: Option<String>,
    /// Lifetime of the payload in the memory tier. Not part of the disk name.
    pub memory_ttl: Duration,
}

impl CacheKey {
    pub fn new(layer_id: LayerId, policy: &RenderPolicy, bbox: Option<&BoundingBox>) -> Self {
        Self {
            layer_id,
            tolerance_bits: policy.tolerance.to_bits(),
            max_features: policy.max_features.get(),
            bbox: bbox.map(BoundingBox::canonical),
            memory_ttl: policy.memory_ttl,
        }
    }

    pub fn tolerance(&self) -> f64 {
        f64::from_bits(self.tolerance_bits)
    }

    /// Stable text form, stored in disk headers.
    pub fn canonical(&self) -> String {
        format!(
            "layer:{}:tolerance:{}:max:{}:bbox:{}",
            self.layer_id,
            self.tolerance(),
            self.max_features,
            self.bbox.as_deref().unwrap_or("all")
        )
    }

    /// Hex SHA-256 of the canonical form; names the disk file.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
