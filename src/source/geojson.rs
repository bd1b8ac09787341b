//! GeoJSON `FeatureCollection` reader.
//!
//! The `features` array is walked element by element on a reader thread, so only
//! the features waiting in the channel are ever held in memory.

use std::{
    fmt,
    fs::File,
    io::BufReader,
    path::Path,
    sync::mpsc::{self, SyncSender},
    thread,
};

use serde::de::{
    self, DeserializeSeed, Deserializer as _, Error as _, IgnoredAny, MapAccess, SeqAccess,
    Visitor,
};
use serde_json::{Map, Value};

use super::{FeatureItem, FeatureSequence, PartialFeatureError, SourceError};
use crate::{
    domain::feature::{Feature, FeatureId},
    geometry::decode_geometry,
};

const CHANNEL_DEPTH: usize = 1_024;
const RECEIVER_GONE: &str = "feature receiver dropped";

pub fn open(path: &Path) -> Result<FeatureSequence, SourceError> {
    let file = File::open(path).map_err(|err| SourceError::io(path, err))?;

    let (items, rx) = mpsc::sync_channel::<FeatureItem>(CHANNEL_DEPTH);
    let (opened, opened_rx) = mpsc::sync_channel::<Result<(), String>>(1);
    thread::Builder::new()
        .name("geojson-reader".into())
        .spawn(move || {
            let mut reporter = Reporter {
                items,
                opened: Some(opened),
                next_index: 0,
            };
            stream_collection(BufReader::new(file), &mut reporter);
        })
        .map_err(|err| SourceError::unavailable(path.display().to_string(), err.to_string()))?;

    match opened_rx.recv() {
        Ok(Ok(())) => Ok(FeatureSequence::new(rx.into_iter(), None)),
        Ok(Err(reason)) => Err(SourceError::format(path, format!("invalid GeoJSON: {reason}"))),
        Err(_) => Err(SourceError::format(path, "GeoJSON reader stopped unexpectedly")),
    }
}

fn stream_collection<R: std::io::Read>(reader: R, reporter: &mut Reporter) {
    let mut json = serde_json::Deserializer::from_reader(reader);
    let outcome = (&mut json)
        .deserialize_map(RootVisitor {
            reporter: &mut *reporter,
        })
        .and_then(|()| json.end());

    match outcome {
        Ok(()) => reporter.accept(),
        Err(err) if err.to_string().starts_with(RECEIVER_GONE) => {}
        Err(err) => {
            // Past the opening, a broken document ends the sequence with one skipped item.
            if !reporter.reject(err.to_string()) {
                let index = reporter.next_index;
                reporter.send(Err(PartialFeatureError::new(
                    index,
                    format!("invalid GeoJSON: {err}"),
                )));
            }
        }
    }
}

struct Reporter {
    items: SyncSender<FeatureItem>,
    opened: Option<SyncSender<Result<(), String>>>,
    next_index: u64,
}

impl Reporter {
    fn accept(&mut self) {
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(Ok(()));
        }
    }

    /// Whether the rejection reached `open`; false once features are flowing.
    fn reject(&mut self, reason: String) -> bool {
        match self.opened.take() {
            Some(opened) => {
                let _ = opened.send(Err(reason));
                true
            }
            None => false,
        }
    }

    fn send(&mut self, item: FeatureItem) -> bool {
        self.items.send(item).is_ok()
    }
}

struct RootVisitor<'a> {
    reporter: &'a mut Reporter,
}

impl<'de> Visitor<'de> for RootVisitor<'_> {
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a GeoJSON FeatureCollection object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let mut seen_type = false;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "type" => {
                    let kind: String = map.next_value()?;
                    if kind != "FeatureCollection" {
                        return Err(A::Error::custom(format!(
                            "expected a FeatureCollection, found `{kind}`"
                        )));
                    }
                    seen_type = true;
                }
                "features" => {
                    self.reporter.accept();
                    map.next_value_seed(FeaturesSeed {
                        reporter: &mut *self.reporter,
                    })?;
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        if !seen_type {
            return Err(A::Error::custom("GeoJSON root has no `type`"));
        }
        Ok(())
    }
}

struct FeaturesSeed<'a> {
    reporter: &'a mut Reporter,
}

impl<'de> DeserializeSeed<'de> for FeaturesSeed<'_> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for FeaturesSeed<'_> {
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an array of GeoJSON features")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(value) = seq.next_element::<Value>()? {
            let index = self.reporter.next_index;
            self.reporter.next_index += 1;
            if !self.reporter.send(convert_feature(index, value)) {
                return Err(A::Error::custom(RECEIVER_GONE));
            }
        }
        Ok(())
    }
}

fn convert_feature(index: u64, value: Value) -> FeatureItem {
    let Value::Object(mut object) = value else {
        return Err(PartialFeatureError::new(index, "feature is not an object"));
    };

    let geometry = match object.get("geometry") {
        None | Some(Value::Null) => {
            return Err(PartialFeatureError::new(index, "feature has no geometry"));
        }
        Some(raw) => decode_geometry(raw)
            .map_err(|err| PartialFeatureError::new(index, err.to_string()))?,
    };

    let id = match object.get("id") {
        Some(Value::String(id)) => FeatureId::Named(id.clone()),
        Some(Value::Number(number)) => match number.as_u64() {
            Some(id) => FeatureId::Index(id),
            None => FeatureId::Named(number.to_string()),
        },
        _ => FeatureId::Index(index),
    };

    let properties = match object.remove("properties") {
        Some(Value::Object(properties)) => properties,
        _ => Map::new(),
    };

    Ok(Feature::new(id, geometry, properties))
}
