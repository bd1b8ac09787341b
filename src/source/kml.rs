//! KML/KMZ placemark reader.
//!
//! Placemarks are decoded one at a time from the XML event stream. `name` and
//! `description` become properties, as do `ExtendedData` values.

use std::{
    fs::File,
    io::{BufRead, BufReader, Cursor},
    path::{Path, PathBuf},
};

use geo::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use quick_xml::{Reader, events::Event};
use serde_json::{Map, Value};

use super::{FeatureItem, FeatureSequence, PartialFeatureError, SourceError, archive};
use crate::domain::feature::{Feature, FeatureId};

pub fn open(path: &Path) -> Result<FeatureSequence, SourceError> {
    let is_kmz = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("kmz"));

    if is_kmz {
        let bytes = archive::read_first_entry(path, "kml")?;
        let placemarks = Placemarks::start(Cursor::new(bytes), path)?;
        return Ok(FeatureSequence::new(placemarks, None));
    }

    let file = File::open(path).map_err(|err| SourceError::io(path, err))?;
    let placemarks = Placemarks::start(BufReader::new(file), path)?;
    Ok(FeatureSequence::new(placemarks, None))
}

const CAPTURED: [&str; 5] = ["name", "description", "coordinates", "value", "SimpleData"];

#[derive(Debug, Default)]
struct PlacemarkBuilder {
    id: Option<String>,
    properties: Map<String, Value>,
    geometries: Vec<Geometry<f64>>,
    outer: Option<LineString<f64>>,
    inner: Vec<LineString<f64>>,
    data_key: Option<String>,
    text: String,
    problem: Option<String>,
}

impl PlacemarkBuilder {
    fn fail(&mut self, reason: impl Into<String>) {
        if self.problem.is_none() {
            self.problem = Some(reason.into());
        }
    }

    fn finish(self, index: u64) -> FeatureItem {
        if let Some(problem) = self.problem {
            return Err(PartialFeatureError::new(index, problem));
        }
        let geometry = combine(self.geometries)
            .ok_or_else(|| PartialFeatureError::new(index, "placemark has no geometry"))?;
        let id = match self.id {
            Some(id) => FeatureId::Named(id),
            None => FeatureId::Index(index),
        };
        Ok(Feature::new(id, geometry, self.properties))
    }
}

struct Placemarks<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    stack: Vec<String>,
    current: Option<PlacemarkBuilder>,
    index: u64,
    done: bool,
}

impl<R: BufRead> Placemarks<R> {
    /// Position the reader past the `<kml>` root, rejecting anything else.
    fn start(source: R, path: &Path) -> Result<Self, SourceError> {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(element)) => {
                    let name = local_name(element.local_name().as_ref());
                    if name != "kml" {
                        return Err(format_error(path, format!("unexpected root `{name}`")));
                    }
                    break;
                }
                Ok(Event::Empty(_)) | Ok(Event::Eof) => {
                    return Err(format_error(path, "document has no <kml> root"));
                }
                Ok(_) => continue,
                Err(err) => return Err(format_error(path, format!("invalid XML: {err}"))),
            }
        }

        Ok(Self {
            reader,
            buf,
            stack: vec!["kml".to_string()],
            current: None,
            index: 0,
            done: false,
        })
    }

    fn on_start(&mut self, name: String, id: Option<String>, data_key: Option<String>) {
        if name == "Placemark" {
            self.current = Some(PlacemarkBuilder {
                id,
                ..PlacemarkBuilder::default()
            });
        } else if let Some(builder) = self.current.as_mut() {
            match name.as_str() {
                "Polygon" => {
                    builder.outer = None;
                    builder.inner.clear();
                }
                "Data" | "SimpleData" => builder.data_key = data_key,
                _ => {}
            }
            if CAPTURED.contains(&name.as_str()) {
                builder.text.clear();
            }
        }
        self.stack.push(name);
    }

    fn on_text(&mut self, text: &str) {
        let capturing = self
            .stack
            .last()
            .is_some_and(|element| CAPTURED.contains(&element.as_str()));
        if let (true, Some(builder)) = (capturing, self.current.as_mut()) {
            builder.text.push_str(text);
        }
    }

    /// Returns a finished placemark when its closing tag is reached.
    fn on_end(&mut self) -> Option<FeatureItem> {
        let name = self.stack.pop()?;
        let parent = self.stack.last().cloned().unwrap_or_default();
        let grandparent_outer = self
            .stack
            .iter()
            .rev()
            .nth(1)
            .and_then(|name| match name.as_str() {
                "outerBoundaryIs" => Some(true),
                "innerBoundaryIs" => Some(false),
                _ => None,
            });

        if name == "Placemark" {
            let builder = self.current.take()?;
            let index = self.index;
            self.index += 1;
            return Some(builder.finish(index));
        }

        let builder = self.current.as_mut()?;
        let text = builder.text.trim().to_string();
        match name.as_str() {
            "name" | "description" if parent == "Placemark" => {
                if !text.is_empty() {
                    builder.properties.insert(name, Value::from(text));
                }
            }
            "value" if parent == "Data" => {
                if let Some(key) = builder.data_key.clone() {
                    builder.properties.insert(key, Value::from(text));
                }
            }
            "SimpleData" => {
                if let Some(key) = builder.data_key.take() {
                    builder.properties.insert(key, Value::from(text));
                }
            }
            "coordinates" => match parse_coordinates(&text) {
                Ok(coords) => match parent.as_str() {
                    "Point" => match coords.first() {
                        Some(coord) => builder.geometries.push(Geometry::Point(Point(*coord))),
                        None => builder.fail("point without coordinates"),
                    },
                    "LineString" => builder
                        .geometries
                        .push(Geometry::LineString(LineString(coords))),
                    "LinearRing" => match grandparent_outer {
                        Some(true) => builder.outer = Some(LineString(coords)),
                        Some(false) => builder.inner.push(LineString(coords)),
                        None => builder.fail("ring outside of a polygon boundary"),
                    },
                    _ => {}
                },
                Err(reason) => builder.fail(reason),
            },
            "Polygon" => match builder.outer.take() {
                Some(outer) => {
                    let inner = std::mem::take(&mut builder.inner);
                    builder
                        .geometries
                        .push(Geometry::Polygon(Polygon::new(outer, inner)));
                }
                None => builder.fail("polygon without outer boundary"),
            },
            _ => {}
        }
        None
    }
}

impl<R: BufRead> Iterator for Placemarks<R> {
    type Item = FeatureItem;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            self.buf.clear();
            let step = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(element)) => {
                    let name = local_name(element.local_name().as_ref());
                    let id = attribute(&element, "id");
                    let data_key = attribute(&element, "name");
                    Step::Start(name, id, data_key)
                }
                Ok(Event::End(_)) => Step::End,
                Ok(Event::Text(text)) => match text.unescape() {
                    Ok(text) => Step::Text(text.into_owned()),
                    Err(err) => Step::BadText(err.to_string()),
                },
                Ok(Event::CData(data)) => {
                    Step::Text(String::from_utf8_lossy(&data.into_inner()).into_owned())
                }
                Ok(Event::Eof) => Step::Eof,
                Ok(_) => Step::Skip,
                Err(err) => Step::Broken(err.to_string()),
            };

            match step {
                Step::Start(name, id, data_key) => self.on_start(name, id, data_key),
                Step::End => {
                    if let Some(item) = self.on_end() {
                        return Some(item);
                    }
                }
                Step::Text(text) => self.on_text(&text),
                Step::BadText(reason) => {
                    if let Some(builder) = self.current.as_mut() {
                        builder.fail(reason);
                    }
                }
                Step::Skip => {}
                Step::Eof => {
                    self.done = true;
                    return None;
                }
                Step::Broken(reason) => {
                    self.done = true;
                    return Some(Err(PartialFeatureError::new(
                        self.index,
                        format!("invalid XML: {reason}"),
                    )));
                }
            }
        }
    }
}

enum Step {
    Start(String, Option<String>, Option<String>),
    End,
    Text(String),
    BadText(String),
    Skip,
    Eof,
    Broken(String),
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn attribute(element: &quick_xml::events::BytesStart<'_>, key: &str) -> Option<String> {
    element
        .try_get_attribute(key)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.into_owned()))
}

fn format_error(path: &Path, message: impl Into<String>) -> SourceError {
    SourceError::format(PathBuf::from(path), message)
}

/// Parse `lon,lat[,alt]` tuples separated by whitespace.
fn parse_coordinates(text: &str) -> Result<Vec<Coord<f64>>, String> {
    text.split_whitespace()
        .map(|tuple| {
            let mut parts = tuple.split(',');
            let x = parts.next().and_then(|v| v.trim().parse::<f64>().ok());
            let y = parts.next().and_then(|v| v.trim().parse::<f64>().ok());
            match (x, y) {
                (Some(x), Some(y)) => Ok(Coord { x, y }),
                _ => Err(format!("invalid coordinate tuple `{tuple}`")),
            }
        })
        .collect()
}

fn combine(mut geometries: Vec<Geometry<f64>>) -> Option<Geometry<f64>> {
    match geometries.len() {
        0 => return None,
        1 => return geometries.pop(),
        _ => {}
    }

    if geometries.iter().all(|g| matches!(g, Geometry::Polygon(_))) {
        let polygons = geometries
            .into_iter()
            .filter_map(|g| match g {
                Geometry::Polygon(p) => Some(p),
                _ => None,
            })
            .collect();
        return Some(Geometry::MultiPolygon(MultiPolygon(polygons)));
    }
    if geometries.iter().all(|g| matches!(g, Geometry::LineString(_))) {
        let lines = geometries
            .into_iter()
            .filter_map(|g| match g {
                Geometry::LineString(l) => Some(l),
                _ => None,
            })
            .collect();
        return Some(Geometry::MultiLineString(MultiLineString(lines)));
    }
    if geometries.iter().all(|g| matches!(g, Geometry::Point(_))) {
        let points = geometries
            .into_iter()
            .filter_map(|g| match g {
                Geometry::Point(p) => Some(p),
                _ => None,
            })
            .collect();
        return Some(Geometry::MultiPoint(MultiPoint(points)));
    }
    Some(Geometry::GeometryCollection(GeometryCollection(geometries)))
}
