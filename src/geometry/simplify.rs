//! Douglas–Peucker simplification (`geo::Simplify`) that never breaks ring or line
//! validity.
//!
//! Endpoints of every line and ring are kept. Lines keep at least two points and
//! rings at least four (three distinct vertices plus the closing point). Input that
//! is already below those minimums is returned as is.

use geo::{
    CoordsIter, Geometry, GeometryCollection, LineString, MultiLineString, MultiPolygon, Polygon,
    Simplify,
};

const MIN_RING_POINTS: usize = 4;

/// Simplify a geometry with the given tolerance in coordinate units.
///
/// A tolerance that is not a positive finite number returns the input unchanged.
pub fn simplify(geometry: &Geometry<f64>, tolerance: f64) -> Geometry<f64> {
    if !tolerance.is_finite() || tolerance <= 0.0 {
        return geometry.clone();
    }

    match geometry {
        Geometry::LineString(line) => Geometry::LineString(simplify_line(line, tolerance)),
        Geometry::MultiLineString(lines) => Geometry::MultiLineString(MultiLineString(
            lines
                .0
                .iter()
                .map(|line| simplify_line(line, tolerance))
                .collect(),
        )),
        Geometry::Polygon(polygon) => Geometry::Polygon(simplify_polygon(polygon, tolerance)),
        Geometry::MultiPolygon(polygons) => Geometry::MultiPolygon(MultiPolygon(
            polygons
                .0
                .iter()
                .map(|polygon| simplify_polygon(polygon, tolerance))
                .collect(),
        )),
        Geometry::GeometryCollection(collection) => {
            Geometry::GeometryCollection(GeometryCollection(
                collection
                    .0
                    .iter()
                    .map(|inner| simplify(inner, tolerance))
                    .collect(),
            ))
        }
        // Points, segments, rects and triangles have nothing to drop.
        other => other.clone(),
    }
}

/// Total number of coordinates, closing ring points included.
pub fn vertex_count(geometry: &Geometry<f64>) -> usize {
    geometry.coords_count()
}

fn simplify_line(line: &LineString<f64>, tolerance: f64) -> LineString<f64> {
    line.simplify(&tolerance)
}

fn simplify_polygon(polygon: &Polygon<f64>, tolerance: f64) -> Polygon<f64> {
    let exterior = simplify_ring(polygon.exterior(), tolerance);
    let interiors = polygon
        .interiors()
        .iter()
        .map(|ring| simplify_ring(ring, tolerance))
        .collect();
    Polygon::new(exterior, interiors)
}

// Rings go through the line simplifier rather than `Polygon::simplify`, which hands
// back the untouched ring once it would collapse and so keeps more vertices at a
// coarser tolerance than at a finer one.
fn simplify_ring(ring: &LineString<f64>, tolerance: f64) -> LineString<f64> {
    let points = &ring.0;
    if points.len() <= MIN_RING_POINTS {
        return ring.clone();
    }

    let simplified = ring.simplify(&tolerance);
    if simplified.0.len() >= MIN_RING_POINTS {
        return simplified;
    }

    // Collapsed below a valid ring: keep evenly spread vertices instead.
    let n = points.len();
    LineString(
        [0, n / 3, (2 * n) / 3, n - 1]
            .into_iter()
            .map(|index| points[index])
            .collect(),
    )
}
