//! Feature store readers.
//!
//! Every reader produces a [`FeatureSequence`]: a forward-only iterator of features
//! where malformed records surface as [`PartialFeatureError`] items instead of
//! aborting the whole read.

pub mod archive;
pub mod fingerprint;
pub mod geojson;
pub mod kml;
pub mod shapefile;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::{feature::Feature, layer::SourceFormat};

pub use archive::{ArchiveKind, prepare_source, remove_all_extractions, remove_extractions};
pub use fingerprint::{Fingerprint, fingerprint_source};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("could not read `{path}`: {message}")]
    Format { path: PathBuf, message: String },
    #[error("source `{locator}` unavailable: {message}")]
    Unavailable { locator: String, message: String },
}

impl SourceError {
    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(locator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            locator: locator.into(),
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Failing to open a file that should exist is an availability problem, not a format one.
    pub fn io(path: &Path, err: std::io::Error) -> Self {
        Self::unavailable(path.display().to_string(), err.to_string())
    }
}

/// A single record that could not be turned into a feature.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("record {index} skipped: {reason}")]
pub struct PartialFeatureError {
    pub index: u64,
    pub reason: String,
}

impl PartialFeatureError {
    pub fn new(index: u64, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
        }
    }
}

pub type FeatureItem = Result<Feature, PartialFeatureError>;

/// Lazy, finite sequence of features read from one source.
pub struct FeatureSequence {
    inner: Box<dyn Iterator<Item = FeatureItem> + Send>,
    total_hint: Option<u64>,
    yielded: u64,
    exhausted: bool,
}

impl FeatureSequence {
    pub fn new<I>(inner: I, total_hint: Option<u64>) -> Self
    where
        I: Iterator<Item = FeatureItem> + Send + 'static,
    {
        Self {
            inner: Box::new(inner),
            total_hint,
            yielded: 0,
            exhausted: false,
        }
    }

    /// Record count, known upfront for indexed formats or after full consumption.
    ///
    /// Skipped records are part of the total.
    pub fn total_feature_count(&self) -> Option<u64> {
        self.total_hint
            .or_else(|| self.exhausted.then_some(self.yielded))
    }
}

impl Iterator for FeatureSequence {
    type Item = FeatureItem;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.inner.next() {
            Some(item) => {
                self.yielded += 1;
                Some(item)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

impl std::fmt::Debug for FeatureSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureSequence")
            .field("total_hint", &self.total_hint)
            .field("yielded", &self.yielded)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Open an already materialized, unpacked source file.
pub fn open(path: &Path, format: SourceFormat) -> Result<FeatureSequence, SourceError> {
    match format {
        SourceFormat::GeoJson => geojson::open(path),
        SourceFormat::Shapefile => shapefile::open(path),
        SourceFormat::Kml => kml::open(path),
    }
}

#[cfg(test)]
mod tests {
    use geo::{Geometry, Point};
    use serde_json::Map;

    use super::*;
    use crate::domain::feature::FeatureId;

    #[test]
    fn total_is_known_after_consumption() {
        let items = vec![
            Ok(Feature::new(
                FeatureId::Index(0),
                Geometry::Point(Point::new(0.0, 0.0)),
                Map::new(),
            )),
            Err(PartialFeatureError::new(1, "bad")),
        ];
        let mut sequence = FeatureSequence::new(items.into_iter(), None);
        assert_eq!(sequence.total_feature_count(), None);
        assert_eq!(sequence.by_ref().count(), 2);
        assert_eq!(sequence.total_feature_count(), Some(2));
        assert!(sequence.next().is_none());
    }

    #[test]
    fn hint_is_reported_immediately() {
        let sequence = FeatureSequence::new(std::iter::empty(), Some(42));
        assert_eq!(sequence.total_feature_count(), Some(42));
    }
}
