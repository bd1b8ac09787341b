//! Layer descriptors as handed over by the persistence collaborator.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::DomainError;

/// Identifier of a map layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(pub i64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the bytes of a file-backed layer live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceLocator {
    Local(PathBuf),
    Remote(Url),
}

impl SourceLocator {
    /// Interpret a catalog string: `http(s)://` URLs are remote, everything else is a path.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("source locator must not be empty"));
        }

        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = Url::parse(trimmed)
                .map_err(|err| DomainError::validation(format!("invalid source url: {err}")))?;
            return Ok(Self::Remote(url));
        }

        Ok(Self::Local(PathBuf::from(trimmed)))
    }

    /// Final path segment, used to infer archive handling.
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            Self::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .map(str::to_string),
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => write!(f, "{url}"),
        }
    }
}

/// File formats the pipeline can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    GeoJson,
    Shapefile,
    Kml,
}

impl SourceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GeoJson => "geojson",
            Self::Shapefile => "shapefile",
            Self::Kml => "kml",
        }
    }
}

/// Check a WMS or tile service URL, keeping the template text untouched.
pub fn service_url(raw: &str) -> Result<String, DomainError> {
    let trimmed = raw.trim();
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(DomainError::validation(format!(
            "service url `{trimmed}` must use http or https"
        )));
    }
    Url::parse(trimmed)
        .map_err(|err| DomainError::validation(format!("invalid service url: {err}")))?;
    Ok(trimmed.to_string())
}

/// Layer kind with only the fields each variant needs.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    GeoJson { source: SourceLocator },
    Shapefile { source: SourceLocator },
    Kml { source: SourceLocator },
    /// URLs stay verbatim so tile templates keep their `{z}/{x}/{y}` placeholders.
    Wms { url: String },
    Tile { url: String },
}

impl LayerKind {
    /// Short type name exposed to clients.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::GeoJson { .. } => "geojson",
            Self::Shapefile { .. } => "shapefile",
            Self::Kml { .. } => "kml",
            Self::Wms { .. } => "wms",
            Self::Tile { .. } => "tile",
        }
    }

    /// File-backed source for pipeline layers, `None` for pass-through layers.
    pub fn vector_source(&self) -> Option<(&SourceLocator, SourceFormat)> {
        match self {
            Self::GeoJson { source } => Some((source, SourceFormat::GeoJson)),
            Self::Shapefile { source } => Some((source, SourceFormat::Shapefile)),
            Self::Kml { source } => Some((source, SourceFormat::Kml)),
            Self::Wms { .. } | Self::Tile { .. } => None,
        }
    }

    /// Service URL of pass-through layers.
    pub fn remote_url(&self) -> Option<&str> {
        match self {
            Self::Wms { url } | Self::Tile { url } => Some(url),
            _ => None,
        }
    }
}

/// A named geospatial data source rendered on the map.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub description: Option<String>,
    pub kind: LayerKind,
    pub region_id: Option<i64>,
    pub z_index: i32,
    pub is_active: bool,
    pub is_base_layer: bool,
    pub is_visible_by_default: bool,
    pub style: Option<serde_json::Value>,
}

impl Layer {
    /// Whether the layer is offered to clients viewing `region_id`.
    ///
    /// Region-less layers are shared by every region.
    pub fn visible_in_region(&self, region_id: Option<i64>) -> bool {
        match (region_id, self.region_id) {
            (None, _) | (_, None) => true,
            (Some(requested), Some(own)) => requested == own,
        }
    }
}

/// Order used by the layer control: overlays before base maps, higher z-index first, then name.
pub fn sort_for_layer_control(layers: &mut [Layer]) {
    layers.sort_by(|a, b| {
        a.is_base_layer
            .cmp(&b.is_base_layer)
            .then_with(|| b.z_index.cmp(&a.z_index))
            .then_with(|| a.name.cmp(&b.name))
    });
}
