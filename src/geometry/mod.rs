//! Geometry helpers shared by the readers and the serving pipeline.

pub mod geojson;
pub mod simplify;

pub use geojson::{GeometryDecodeError, decode_geometry, encode_geometry};
pub use simplify::{simplify, vertex_count};

use geo::{BoundingRect, Geometry};

/// Viewport filter in lon/lat order: `minx,miny,maxx,maxy`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Option<Self> {
        let finite = [min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite());
        if !finite || min_x > max_x || min_y > max_y {
            return None;
        }
        Some(Self {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    /// Parse the `bbox` query form, e.g. `-122.5,37.7,-122.3,37.8`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(',').map(|part| part.trim().parse::<f64>());
        let min_x = parts.next()?.ok()?;
        let min_y = parts.next()?.ok()?;
        let max_x = parts.next()?.ok()?;
        let max_y = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        Self::new(min_x, min_y, max_x, max_y)
    }

    /// Whether the geometry's bounding rectangle touches this box.
    pub fn intersects(&self, geometry: &Geometry<f64>) -> bool {
        let Some(rect) = geometry.bounding_rect() else {
            return false;
        };
        rect.min().x <= self.max_x
            && rect.max().x >= self.min_x
            && rect.min().y <= self.max_y
            && rect.max().y >= self.min_y
    }

    /// Canonical text form used inside cache keys.
    pub fn canonical(&self) -> String {
        format!(
            "{},{},{},{}",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}
