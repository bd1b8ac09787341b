//! TOML-backed layer catalog.
//!
//! ```toml
//! [[layers]]
//! id = 1
//! name = "Parcels"
//! type = "shapefile"
//! source = "data/parcels.zip"
//! region_id = 3
//! z_index = 10
//! style = { color = "#ff7800", weight = 1 }
//!
//! [[layers]]
//! id = 2
//! name = "Imagery"
//! type = "wms"
//! url = "https://maps.example.com/wms"
//! is_base_layer = true
//! ```
//!
//! Relative local sources resolve against the directory holding the catalog file.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::error::InfraError;
use crate::{
    application::repos::{LayerRepo, RepoError},
    domain::layer::{Layer, LayerId, LayerKind, SourceLocator, service_url},
};

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    layers: Vec<RawLayer>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawLayerType {
    Geojson,
    Shapefile,
    Kml,
    Wms,
    Tile,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawLayer {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    layer_type: RawLayerType,
    source: Option<String>,
    url: Option<String>,
    description: Option<String>,
    region_id: Option<i64>,
    #[serde(default)]
    z_index: i32,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    is_base_layer: bool,
    #[serde(default = "default_true")]
    is_visible_by_default: bool,
    style: Option<serde_json::Value>,
}

impl RawLayer {
    fn into_layer(self, base_dir: Option<&Path>) -> Result<Layer, InfraError> {
        let id = self.id;
        let invalid = |message: String| InfraError::catalog(format!("layer {id}: {message}"));

        let source = |raw: Option<String>| -> Result<SourceLocator, InfraError> {
            let raw = raw.ok_or_else(|| invalid("`source` is required".to_string()))?;
            let locator = SourceLocator::parse(&raw).map_err(|err| invalid(err.to_string()))?;
            Ok(match (locator, base_dir) {
                (SourceLocator::Local(path), Some(base)) if path.is_relative() => {
                    SourceLocator::Local(base.join(path))
                }
                (locator, _) => locator,
            })
        };
        let url = |raw: Option<String>| -> Result<String, InfraError> {
            let raw = raw.ok_or_else(|| invalid("`url` is required".to_string()))?;
            service_url(&raw).map_err(|err| invalid(err.to_string()))
        };

        let kind = match self.layer_type {
            RawLayerType::Geojson => LayerKind::GeoJson {
                source: source(self.source)?,
            },
            RawLayerType::Shapefile => LayerKind::Shapefile {
                source: source(self.source)?,
            },
            RawLayerType::Kml => LayerKind::Kml {
                source: source(self.source)?,
            },
            RawLayerType::Wms => LayerKind::Wms {
                url: url(self.url)?,
            },
            RawLayerType::Tile => LayerKind::Tile {
                url: url(self.url)?,
            },
        };

        if self.name.trim().is_empty() {
            return Err(invalid("`name` must not be empty".to_string()));
        }
        if self.style.as_ref().is_some_and(|style| !style.is_object()) {
            return Err(invalid("`style` must be a table".to_string()));
        }

        Ok(Layer {
            id: LayerId(id),
            name: self.name,
            description: self.description,
            kind,
            region_id: self.region_id,
            z_index: self.z_index,
            is_active: self.is_active,
            is_base_layer: self.is_base_layer,
            is_visible_by_default: self.is_visible_by_default,
            style: self.style,
        })
    }
}

/// Immutable set of layers loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct LayerCatalog {
    layers: BTreeMap<LayerId, Layer>,
}

impl LayerCatalog {
    pub fn from_layers(layers: impl IntoIterator<Item = Layer>) -> Result<Self, InfraError> {
        let mut map = BTreeMap::new();
        for layer in layers {
            let id = layer.id;
            if map.insert(id, layer).is_some() {
                return Err(InfraError::catalog(format!("duplicate layer id {id}")));
            }
        }
        Ok(Self { layers: map })
    }

    /// Parse catalog text; relative sources resolve against `base_dir` when given.
    pub fn from_toml_str(raw: &str, base_dir: Option<&Path>) -> Result<Self, InfraError> {
        let catalog: RawCatalog =
            toml::from_str(raw).map_err(|err| InfraError::catalog(err.to_string()))?;
        let layers = catalog
            .layers
            .into_iter()
            .map(|layer| layer.into_layer(base_dir))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_layers(layers)
    }

    pub fn load(path: &Path) -> Result<Self, InfraError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            InfraError::catalog(format!("failed to read `{}`: {err}", path.display()))
        })?;
        let base_dir: Option<PathBuf> = path.parent().map(Path::to_path_buf);
        let catalog = Self::from_toml_str(&raw, base_dir.as_deref())?;
        info!(
            path = %path.display(),
            layers = catalog.len(),
            "Loaded layer catalog"
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[async_trait]
impl LayerRepo for LayerCatalog {
    async fn get_layer(&self, id: LayerId) -> Result<Option<Layer>, RepoError> {
        Ok(self.layers.get(&id).cloned())
    }

    async fn list_layers(&self) -> Result<Vec<Layer>, RepoError> {
        Ok(self.layers.values().cloned().collect())
    }
}
