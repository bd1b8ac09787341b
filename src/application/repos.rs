//! Ports to the collaborators the serving pipeline depends on.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::layer::{Layer, LayerId, SourceLocator};
use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("invalid layer record `{layer}`: {message}")]
    InvalidRecord { layer: String, message: String },
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_record(layer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            layer: layer.into(),
            message: message.into(),
        }
    }
}

/// Read access to layer descriptors.
#[async_trait]
pub trait LayerRepo: Send + Sync {
    async fn get_layer(&self, id: LayerId) -> Result<Option<Layer>, RepoError>;

    /// Every known layer, active or not, in no particular order.
    async fn list_layers(&self) -> Result<Vec<Layer>, RepoError>;
}

/// Turns a locator into a readable local file.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn materialize(&self, locator: &SourceLocator) -> Result<PathBuf, SourceError>;

    /// Drop any local copy staged for `locator` so the next `materialize` fetches it again.
    /// Returns the path `materialize` hands out for it.
    async fn release(&self, locator: &SourceLocator) -> Result<PathBuf, SourceError>;

    /// Drop every staged copy.
    async fn release_all(&self) -> Result<(), SourceError>;
}
