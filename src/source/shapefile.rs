//! ESRI shapefile reader (`.shp` + `.shx` + `.dbf`).
//!
//! The `shapefile` crate hands out iterators that borrow the reader, so records are
//! decoded on a dedicated thread and handed over through a bounded channel.

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
};

use geo::{Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};
use serde_json::{Map, Value};
use shapefile::{
    Shape, ShapeReader,
    dbase::{self, FieldValue, Record},
};
use tracing::debug;

use super::{FeatureItem, FeatureSequence, PartialFeatureError, SourceError};
use crate::domain::feature::{Feature, FeatureId};

const CHANNEL_DEPTH: usize = 1_024;

pub fn open(path: &Path) -> Result<FeatureSequence, SourceError> {
    if !path.is_file() {
        return Err(SourceError::unavailable(
            path.display().to_string(),
            "shapefile not found",
        ));
    }
    let index_path = companion(path, "shx")
        .ok_or_else(|| SourceError::format(path, "missing `.shx` companion file"))?;
    let table_path = companion(path, "dbf")
        .ok_or_else(|| SourceError::format(path, "missing `.dbf` companion file"))?;
    let shapes_source = BufReader::new(File::open(path).map_err(|err| SourceError::io(path, err))?);
    let index_source =
        BufReader::new(File::open(&index_path).map_err(|err| SourceError::io(&index_path, err))?);
    let table_source =
        BufReader::new(File::open(&table_path).map_err(|err| SourceError::io(&table_path, err))?);

    let mut shapes = ShapeReader::with_shx(shapes_source, index_source)
        .map_err(|err| SourceError::format(path, format!("invalid shapefile: {err}")))?;
    let mut table = dbase::Reader::new(table_source)
        .map_err(|err| SourceError::format(&table_path, format!("invalid attribute table: {err}")))?;
    let total = shapes
        .shape_count()
        .map_err(|err| SourceError::format(path, format!("invalid shapefile index: {err}")))?;

    let (tx, rx) = mpsc::sync_channel::<FeatureItem>(CHANNEL_DEPTH);
    let shown = path.display().to_string();
    thread::Builder::new()
        .name("shapefile-reader".into())
        .spawn(move || {
            // Shapes are located through the `.shx` offsets and attribute rows have a
            // fixed width, so both cursors stay aligned past a broken record.
            let mut records = table.iter_records();
            for (index, shape) in shapes.iter_shapes().enumerate() {
                let index = index as u64;
                let record = records.next();
                let item = match (shape, record) {
                    (Ok(shape), Some(Ok(record))) => convert(index, shape, record),
                    (Ok(_), Some(Err(err))) => Err(PartialFeatureError::new(
                        index,
                        format!("unreadable attributes: {err}"),
                    )),
                    (Ok(_), None) => Err(PartialFeatureError::new(index, "no attribute row")),
                    (Err(err), _) => Err(PartialFeatureError::new(
                        index,
                        format!("unreadable shape: {err}"),
                    )),
                };
                if let Err(skipped) = &item {
                    debug!(
                        path = %shown,
                        index,
                        reason = %skipped.reason,
                        "Skipping shapefile record"
                    );
                }
                if tx.send(item).is_err() {
                    // Receiver dropped; nobody wants the rest.
                    break;
                }
            }
        })
        .map_err(|err| SourceError::unavailable(path.display().to_string(), err.to_string()))?;

    Ok(FeatureSequence::new(rx.into_iter(), Some(total as u64)))
}

/// Sibling file with the same stem and the given extension, in either case.
pub fn companion(path: &Path, extension: &str) -> Option<PathBuf> {
    [extension.to_ascii_lowercase(), extension.to_ascii_uppercase()]
        .into_iter()
        .map(|ext| path.with_extension(ext))
        .find(|candidate| candidate.is_file())
}

fn convert(index: u64, shape: Shape, record: Record) -> FeatureItem {
    let geometry = shape_to_geometry(shape)
        .ok_or_else(|| PartialFeatureError::new(index, "record has no usable geometry"))?;
    Ok(Feature::new(
        FeatureId::Index(index),
        geometry,
        record_properties(record),
    ))
}

fn shape_to_geometry(shape: Shape) -> Option<Geometry<f64>> {
    let geometry = match shape {
        Shape::NullShape => return None,
        Shape::Point(p) => Geometry::Point(Point::new(p.x, p.y)),
        Shape::PointM(p) => Geometry::Point(Point::new(p.x, p.y)),
        Shape::PointZ(p) => Geometry::Point(Point::new(p.x, p.y)),
        Shape::Multipoint(mp) => Geometry::MultiPoint(MultiPoint(
            mp.points().iter().map(|p| Point::new(p.x, p.y)).collect(),
        )),
        Shape::MultipointM(mp) => Geometry::MultiPoint(MultiPoint(
            mp.points().iter().map(|p| Point::new(p.x, p.y)).collect(),
        )),
        Shape::MultipointZ(mp) => Geometry::MultiPoint(MultiPoint(
            mp.points().iter().map(|p| Point::new(p.x, p.y)).collect(),
        )),
        Shape::Polyline(line) => lines_to_geometry(
            line.parts()
                .iter()
                .map(|part| part.iter().map(|p| Coord { x: p.x, y: p.y }).collect()),
        ),
        Shape::PolylineM(line) => lines_to_geometry(
            line.parts()
                .iter()
                .map(|part| part.iter().map(|p| Coord { x: p.x, y: p.y }).collect()),
        ),
        Shape::PolylineZ(line) => lines_to_geometry(
            line.parts()
                .iter()
                .map(|part| part.iter().map(|p| Coord { x: p.x, y: p.y }).collect()),
        ),
        Shape::Polygon(polygon) => rings_to_geometry(polygon.rings().iter().map(|ring| {
            (
                ring.points().iter().map(|p| Coord { x: p.x, y: p.y }).collect(),
                matches!(ring, shapefile::PolygonRing::Outer(_)),
            )
        })),
        Shape::PolygonM(polygon) => rings_to_geometry(polygon.rings().iter().map(|ring| {
            (
                ring.points().iter().map(|p| Coord { x: p.x, y: p.y }).collect(),
                matches!(ring, shapefile::PolygonRing::Outer(_)),
            )
        })),
        Shape::PolygonZ(polygon) => rings_to_geometry(polygon.rings().iter().map(|ring| {
            (
                ring.points().iter().map(|p| Coord { x: p.x, y: p.y }).collect(),
                matches!(ring, shapefile::PolygonRing::Outer(_)),
            )
        })),
        Shape::Multipatch(_) => return None,
    };
    Some(geometry)
}

fn lines_to_geometry(parts: impl Iterator<Item = Vec<Coord<f64>>>) -> Geometry<f64> {
    let mut lines: Vec<LineString<f64>> = parts.map(LineString).collect();
    if lines.len() == 1 {
        Geometry::LineString(lines.remove(0))
    } else {
        Geometry::MultiLineString(MultiLineString(lines))
    }
}

/// Shapefiles store each outer ring followed by its holes.
fn rings_to_geometry(rings: impl Iterator<Item = (Vec<Coord<f64>>, bool)>) -> Geometry<f64> {
    let mut polygons: Vec<Polygon<f64>> = Vec::new();
    let mut exterior: Option<LineString<f64>> = None;
    let mut holes: Vec<LineString<f64>> = Vec::new();

    for (coords, is_outer) in rings {
        let ring = LineString(coords);
        if is_outer {
            if let Some(previous) = exterior.take() {
                polygons.push(Polygon::new(previous, std::mem::take(&mut holes)));
            }
            exterior = Some(ring);
        } else {
            holes.push(ring);
        }
    }
    if let Some(last) = exterior {
        polygons.push(Polygon::new(last, holes));
    }

    if polygons.len() == 1 {
        Geometry::Polygon(polygons.remove(0))
    } else {
        Geometry::MultiPolygon(MultiPolygon(polygons))
    }
}

fn record_properties(record: Record) -> Map<String, Value> {
    record
        .into_iter()
        .map(|(name, value)| (name, field_value(value)))
        .collect()
}

fn field_value(value: FieldValue) -> Value {
    match value {
        FieldValue::Character(Some(text)) => Value::from(text.trim().to_string()),
        FieldValue::Numeric(Some(number)) => json_number(number),
        FieldValue::Logical(Some(flag)) => Value::from(flag),
        FieldValue::Integer(number) => Value::from(number),
        FieldValue::Double(number) => json_number(number),
        FieldValue::Float(Some(number)) => json_number(f64::from(number)),
        FieldValue::Character(None)
        | FieldValue::Numeric(None)
        | FieldValue::Logical(None)
        | FieldValue::Float(None) => Value::Null,
        other => Value::from(format!("{other:?}")),
    }
}

fn json_number(number: f64) -> Value {
    serde_json::Number::from_f64(number)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use shapefile::{
        Point as ShpPoint, Polygon as ShpPolygon, PolygonRing, Writer,
        dbase::{FieldName, TableWriterBuilder},
    };

    use super::*;

    fn write_squares(dir: &Path, count: usize) -> PathBuf {
        let path = dir.join("lots.shp");
        let table = TableWriterBuilder::new()
            .add_character_field(FieldName::try_from("LOT").unwrap(), 16);
        let mut writer = Writer::from_path(&path, table).unwrap();
        for i in 0..count {
            let x = i as f64;
            let polygon = ShpPolygon::new(PolygonRing::Outer(vec![
                ShpPoint::new(x, 0.0),
                ShpPoint::new(x, 1.0),
                ShpPoint::new(x + 1.0, 1.0),
                ShpPoint::new(x + 1.0, 0.0),
                ShpPoint::new(x, 0.0),
            ]));
            let mut record = Record::default();
            record.insert("LOT".to_string(), FieldValue::Character(Some(format!("L{i}"))));
            writer.write_shape_and_record(&polygon, &record).unwrap();
        }
        drop(writer);
        path
    }

    #[test]
    fn reads_polygons_with_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_squares(dir.path(), 3);

        let mut sequence = open(&path).unwrap();
        assert_eq!(sequence.total_feature_count(), Some(3));

        let features: Vec<_> = sequence.by_ref().map(Result::unwrap).collect();
        assert_eq!(features.len(), 3);
        assert_eq!(features[1].id, FeatureId::Index(1));
        assert_eq!(features[1].properties["LOT"], "L1");
        assert!(matches!(features[0].geometry, Geometry::Polygon(_)));
    }

    #[test]
    fn unreadable_record_does_not_hide_later_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_squares(dir.path(), 5);

        // Give record 2 an unknown shape type, located through the `.shx` offset table.
        let index = std::fs::read(path.with_extension("shx")).unwrap();
        let entry = 100 + 2 * 8;
        let words = i32::from_be_bytes(index[entry..entry + 4].try_into().unwrap());
        let shape_type_at = words as usize * 2 + 8;
        let mut shapes = std::fs::read(&path).unwrap();
        shapes[shape_type_at..shape_type_at + 4].copy_from_slice(&99i32.to_le_bytes());
        std::fs::write(&path, shapes).unwrap();

        let mut sequence = open(&path).unwrap();
        let items: Vec<_> = sequence.by_ref().collect();
        assert_eq!(items.len(), 5);
        assert_eq!(sequence.total_feature_count(), Some(5));

        assert_eq!(items[2].as_ref().unwrap_err().index, 2);
        let lots: Vec<_> = items
            .iter()
            .filter_map(|item| item.as_ref().ok())
            .map(|feature| feature.properties["LOT"].clone())
            .collect();
        assert_eq!(lots, ["L0", "L1", "L3", "L4"]);
    }

    #[test]
    fn missing_companion_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_squares(dir.path(), 1);
        std::fs::remove_file(path.with_extension("dbf")).unwrap();

        let err = open(&path).unwrap_err();
        assert!(matches!(err, SourceError::Format { .. }), "{err}");
    }

    #[test]
    fn groups_holes_with_their_outer_ring() {
        let square = |offset: f64| {
            vec![
                Coord { x: offset, y: offset },
                Coord { x: offset, y: 4.0 - offset },
                Coord { x: 4.0 - offset, y: 4.0 - offset },
                Coord { x: offset, y: offset },
            ]
        };
        let geometry = rings_to_geometry(
            vec![(square(0.0), true), (square(1.0), false), (square(10.0), true)].into_iter(),
        );
        let Geometry::MultiPolygon(polygons) = geometry else {
            panic!("expected multipolygon");
        };
        assert_eq!(polygons.0.len(), 2);
        assert_eq!(polygons.0[0].interiors().len(), 1);
        assert!(polygons.0[1].interiors().is_empty());
    }
}
