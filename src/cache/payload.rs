use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::source::Fingerprint;

/// Feature accounting recorded alongside every generated payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub total_features: u64,
    pub returned_features: u64,
    pub skipped_features: u64,
    /// RFC 3339 timestamp of generation.
    pub generated_at: String,
}

/// Serialized FeatureCollection plus what it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPayload {
    pub body: Bytes,
    pub meta: PayloadMeta,
    pub fingerprint: Fingerprint,
}

impl CachedPayload {
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Output of a generator before the cache stamps it with a fingerprint.
#[derive(Debug, Clone)]
pub struct GeneratedPayload {
    pub body: Bytes,
    pub meta: PayloadMeta,
}
