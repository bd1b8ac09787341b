//! GeoJSON geometry objects to and from `geo` types.

use geo::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryDecodeError {
    #[error("geometry is not an object")]
    NotAnObject,
    #[error("unsupported geometry type `{0}`")]
    UnsupportedType(String),
    #[error("geometry is missing `{0}`")]
    Missing(&'static str),
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(&'static str),
}

pub fn encode_geometry(geometry: &Geometry<f64>) -> Value {
    match geometry {
        Geometry::Point(point) => json!({
            "type": "Point",
            "coordinates": position(point.0),
        }),
        Geometry::MultiPoint(points) => json!({
            "type": "MultiPoint",
            "coordinates": points.0.iter().map(|p| position(p.0)).collect::<Vec<_>>(),
        }),
        Geometry::Line(line) => json!({
            "type": "LineString",
            "coordinates": [position(line.start), position(line.end)],
        }),
        Geometry::LineString(line) => json!({
            "type": "LineString",
            "coordinates": positions(line),
        }),
        Geometry::MultiLineString(lines) => json!({
            "type": "MultiLineString",
            "coordinates": lines.0.iter().map(positions).collect::<Vec<_>>(),
        }),
        Geometry::Polygon(polygon) => json!({
            "type": "Polygon",
            "coordinates": polygon_rings(polygon),
        }),
        Geometry::MultiPolygon(polygons) => json!({
            "type": "MultiPolygon",
            "coordinates": polygons.0.iter().map(polygon_rings).collect::<Vec<_>>(),
        }),
        Geometry::Rect(rect) => encode_geometry(&Geometry::Polygon(rect.to_polygon())),
        Geometry::Triangle(triangle) => {
            encode_geometry(&Geometry::Polygon(triangle.to_polygon()))
        }
        Geometry::GeometryCollection(collection) => json!({
            "type": "GeometryCollection",
            "geometries": collection.0.iter().map(encode_geometry).collect::<Vec<_>>(),
        }),
    }
}

fn position(coord: Coord<f64>) -> Value {
    json!([coord.x, coord.y])
}

fn positions(line: &LineString<f64>) -> Vec<Value> {
    line.0.iter().copied().map(position).collect()
}

fn polygon_rings(polygon: &Polygon<f64>) -> Vec<Vec<Value>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(positions)
        .collect()
}

pub fn decode_geometry(value: &Value) -> Result<Geometry<f64>, GeometryDecodeError> {
    let object = value.as_object().ok_or(GeometryDecodeError::NotAnObject)?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(GeometryDecodeError::Missing("type"))?;

    if kind == "GeometryCollection" {
        let geometries = object
            .get("geometries")
            .and_then(Value::as_array)
            .ok_or(GeometryDecodeError::Missing("geometries"))?;
        let decoded = geometries
            .iter()
            .map(decode_geometry)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Geometry::GeometryCollection(GeometryCollection(decoded)));
    }

    let coordinates = object
        .get("coordinates")
        .ok_or(GeometryDecodeError::Missing("coordinates"))?;

    let geometry = match kind {
        "Point" => Geometry::Point(Point(parse_position(coordinates)?)),
        "MultiPoint" => Geometry::MultiPoint(MultiPoint(
            array(coordinates)?
                .iter()
                .map(|item| parse_position(item).map(Point))
                .collect::<Result<_, _>>()?,
        )),
        "LineString" => Geometry::LineString(parse_line(coordinates)?),
        "MultiLineString" => Geometry::MultiLineString(MultiLineString(
            array(coordinates)?
                .iter()
                .map(parse_line)
                .collect::<Result<_, _>>()?,
        )),
        "Polygon" => Geometry::Polygon(parse_polygon(coordinates)?),
        "MultiPolygon" => Geometry::MultiPolygon(MultiPolygon(
            array(coordinates)?
                .iter()
                .map(parse_polygon)
                .collect::<Result<_, _>>()?,
        )),
        other => return Err(GeometryDecodeError::UnsupportedType(other.to_string())),
    };

    Ok(geometry)
}

fn array(value: &Value) -> Result<&Vec<Value>, GeometryDecodeError> {
    value
        .as_array()
        .ok_or(GeometryDecodeError::InvalidCoordinates("expected an array"))
}

fn parse_position(value: &Value) -> Result<Coord<f64>, GeometryDecodeError> {
    let items = array(value)?;
    if items.len() < 2 {
        return Err(GeometryDecodeError::InvalidCoordinates(
            "position needs at least two numbers",
        ));
    }
    let x = items[0]
        .as_f64()
        .ok_or(GeometryDecodeError::InvalidCoordinates("x must be a number"))?;
    let y = items[1]
        .as_f64()
        .ok_or(GeometryDecodeError::InvalidCoordinates("y must be a number"))?;
    Ok(Coord { x, y })
}

fn parse_line(value: &Value) -> Result<LineString<f64>, GeometryDecodeError> {
    array(value)?
        .iter()
        .map(parse_position)
        .collect::<Result<Vec<_>, _>>()
        .map(LineString)
}

fn parse_polygon(value: &Value) -> Result<Polygon<f64>, GeometryDecodeError> {
    let mut rings = array(value)?.iter().map(parse_line);
    let exterior = rings
        .next()
        .ok_or(GeometryDecodeError::InvalidCoordinates("polygon has no rings"))??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    // geo closes rings on construction.
    Ok(Polygon::new(exterior, interiors))
}
