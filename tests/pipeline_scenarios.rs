use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parcelmap::{
    application::serving::{
        LayerData, LayerRequest, LayerService, PipelineConfig, Started, VectorData,
    },
    cache::{
        CacheConfig, CacheKey, CacheManager, CacheStatus, GeneratedPayload, GenerationError,
        PayloadMeta, ProgressSink,
    },
    config::RemoteSettings,
    domain::{
        layer::{LayerId, SourceFormat},
        policy::ZoomPolicy,
        progress::ProgressPhase,
    },
    infra::{catalog::LayerCatalog, fetch::HttpFetcher},
    source::{self, fingerprint_source},
};
use serde_json::Value;
use shapefile::{
    Point as ShpPoint, Polygon as ShpPolygon, PolygonRing, Writer,
    dbase::{FieldName, FieldValue, Record, TableWriterBuilder},
};

const THREE_POINTS: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {"type": "Feature", "id": 1, "properties": {"name": "north"}, "geometry": {"type": "Point", "coordinates": [-122.41, 37.79]}},
    {"type": "Feature", "id": 2, "properties": {"name": "center"}, "geometry": {"type": "Point", "coordinates": [-122.42, 37.77]}},
    {"type": "Feature", "id": 3, "properties": {"name": "south"}, "geometry": {"type": "Point", "coordinates": [-122.43, 37.75]}}
  ]
}"#;

const KML_ONE_BROKEN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <Placemark>
      <name>No geometry</name>
      <description>Missing its point</description>
    </Placemark>
    <Placemark>
      <name>Trailhead</name>
      <Point><coordinates>-122.45,37.76,0</coordinates></Point>
    </Placemark>
  </Document>
</kml>"#;

fn remote_settings() -> RemoteSettings {
    RemoteSettings {
        max_attempts: NonZeroU32::new(1).unwrap(),
        initial_backoff: Duration::from_millis(1),
        request_timeout: Duration::from_secs(1),
    }
}

fn service(root: &Path, catalog: &str) -> LayerService {
    service_with_pipeline(
        root,
        catalog,
        PipelineConfig {
            staging_directory: root.join("staging"),
            ..PipelineConfig::default()
        },
    )
}

fn service_with_pipeline(root: &Path, catalog: &str, pipeline: PipelineConfig) -> LayerService {
    let catalog = LayerCatalog::from_toml_str(catalog, Some(root)).unwrap();
    let fetcher = HttpFetcher::new(&remote_settings(), &root.join("staging")).unwrap();
    let cache = Arc::new(CacheManager::new(&CacheConfig {
        disk_directory: root.join("cache"),
        ..CacheConfig::default()
    }));
    LayerService::new(
        Arc::new(catalog),
        Arc::new(fetcher),
        cache,
        ZoomPolicy::default(),
        pipeline,
    )
}

/// Serves whatever `body` holds at `/parcels.geojson` on a loopback port.
async fn serve_remote(body: Arc<Mutex<&'static str>>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = axum::Router::new().route(
        "/parcels.geojson",
        axum::routing::get(move || {
            let body = body.clone();
            async move { *body.lock().unwrap() }
        }),
    );
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/parcels.geojson")
}

fn extraction_dirs(staging: &Path) -> usize {
    match std::fs::read_dir(staging) {
        Ok(entries) => entries
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("extract-")
            })
            .count(),
        Err(_) => 0,
    }
}

fn vector(data: LayerData) -> VectorData {
    match data {
        LayerData::Vector(vector) => vector,
        LayerData::PassThrough(descriptor) => panic!("expected vector data, got {descriptor:?}"),
    }
}

fn body(data: &VectorData) -> Value {
    serde_json::from_slice(&data.payload.body).unwrap()
}

/// Unit squares with a redundant vertex in the middle of every edge.
fn write_parcels(path: &Path, count: usize) {
    let table =
        TableWriterBuilder::new().add_character_field(FieldName::try_from("APN").unwrap(), 16);
    let mut writer = Writer::from_path(path, table).unwrap();
    for i in 0..count {
        let x = (i % 200) as f64 * 2.0;
        let y = (i / 200) as f64 * 2.0;
        let ring = vec![
            ShpPoint::new(x, y),
            ShpPoint::new(x, y + 0.5),
            ShpPoint::new(x, y + 1.0),
            ShpPoint::new(x + 0.5, y + 1.0),
            ShpPoint::new(x + 1.0, y + 1.0),
            ShpPoint::new(x + 1.0, y + 0.5),
            ShpPoint::new(x + 1.0, y),
            ShpPoint::new(x + 0.5, y),
            ShpPoint::new(x, y),
        ];
        let polygon = ShpPolygon::new(PolygonRing::Outer(ring));
        let mut record = Record::default();
        record.insert(
            "APN".to_string(),
            FieldValue::Character(Some(format!("APN-{i:05}"))),
        );
        writer.write_shape_and_record(&polygon, &record).unwrap();
    }
}

#[tokio::test]
async fn small_geojson_layer_is_served_whole() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("points.geojson"), THREE_POINTS).unwrap();
    let layers = service(
        dir.path(),
        r#"
[[layers]]
id = 1
name = "Survey points"
type = "geojson"
source = "points.geojson"
"#,
    );

    let data = vector(
        layers
            .serve(LayerRequest::new(LayerId(1), 10))
            .await
            .unwrap(),
    );
    let json = body(&data);

    assert_eq!(json["type"], "FeatureCollection");
    assert_eq!(json["features"].as_array().unwrap().len(), 3);
    assert_eq!(json["info"]["total_features"], 3);
    assert_eq!(json["info"]["returned_features"], 3);
    assert_eq!(json["info"]["skipped_features"], 0);
    assert_eq!(json["info"]["zoom"], 10);
    assert_eq!(data.status, CacheStatus::Miss);
}

#[tokio::test]
async fn large_shapefile_is_sampled_and_simplified() {
    let dir = tempfile::tempdir().unwrap();
    write_parcels(&dir.path().join("parcels.shp"), 30_000);
    let layers = service(
        dir.path(),
        r#"
[[layers]]
id = 7
name = "Parcels"
type = "shapefile"
source = "parcels.shp"
"#,
    );

    let data = vector(
        layers
            .generate(LayerRequest::new(LayerId(7), 11))
            .await
            .unwrap(),
    );
    let json = body(&data);
    let features = json["features"].as_array().unwrap();

    assert_eq!(features.len(), 10_000);
    assert_eq!(json["info"]["total_features"], 30_000);
    assert_eq!(json["info"]["returned_features"], 10_000);
    assert_eq!(json["info"]["simplification_tolerance"], 0.005);
    assert_eq!(json["info"]["max_features"], 10_000);

    // Collinear edge midpoints are gone after simplification.
    for feature in features.iter().take(50) {
        let ring = feature["geometry"]["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 5, "unexpected ring {ring:?}");
    }

    // Stride sampling keeps every third record.
    assert_eq!(features[0]["properties"]["APN"], "APN-00000");
    assert_eq!(features[1]["properties"]["APN"], "APN-00003");
    assert_eq!(features[9_999]["properties"]["APN"], "APN-29997");
}

#[tokio::test]
async fn progress_reports_each_chunk_then_later_phases_in_order() {
    let dir = tempfile::tempdir().unwrap();
    write_parcels(&dir.path().join("parcels.shp"), 12);
    let layers = service_with_pipeline(
        dir.path(),
        r#"
[[layers]]
id = 8
name = "Parcels"
type = "shapefile"
source = "parcels.shp"
"#,
        PipelineConfig {
            progress_chunk_size: NonZeroUsize::new(1).unwrap(),
            staging_directory: dir.path().join("staging"),
            ..PipelineConfig::default()
        },
    );

    let Started::Pending(pending) = layers
        .start(LayerRequest::new(LayerId(8), 12))
        .await
        .unwrap()
    else {
        panic!("a cold layer should start a generation");
    };
    let (data, mut progress) = pending.into_parts();
    let mut events = Vec::new();
    while let Some(event) = progress.next().await {
        events.push(event);
    }
    let data = vector(data.await.unwrap());
    assert_eq!(data.status, CacheStatus::Miss);

    let phases: Vec<ProgressPhase> = events.iter().map(|event| event.phase).collect();
    let reading = phases
        .iter()
        .take_while(|phase| **phase == ProgressPhase::Reading)
        .count();
    assert_eq!(
        &phases[reading..],
        &[
            ProgressPhase::Simplifying,
            ProgressPhase::Limiting,
            ProgressPhase::Done
        ]
    );

    // One event before the first record, then one per record.
    assert_eq!(reading, 13);
    let loaded: Vec<u64> = events[..reading]
        .iter()
        .map(|event| event.loaded_features)
        .collect();
    assert_eq!(loaded, (0..=12).collect::<Vec<u64>>());
    assert!(
        events[..reading]
            .iter()
            .all(|event| event.total_features == Some(12))
    );
    assert!(events.windows(2).all(|pair| pair[0].percent <= pair[1].percent));
    assert_eq!(events.last().unwrap().percent, 100);
}

#[tokio::test]
async fn repeated_request_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("points.geojson"), THREE_POINTS).unwrap();
    let layers = service(
        dir.path(),
        r#"
[[layers]]
id = 3
name = "Survey points"
type = "geojson"
source = "points.geojson"
"#,
    );

    let first = vector(
        layers
            .serve(LayerRequest::new(LayerId(3), 12))
            .await
            .unwrap(),
    );
    let second = vector(
        layers
            .serve(LayerRequest::new(LayerId(3), 12))
            .await
            .unwrap(),
    );

    assert_eq!(first.status, CacheStatus::Miss);
    assert_eq!(second.status, CacheStatus::MemoryHit);
    assert!(Arc::ptr_eq(&first.payload, &second.payload));
}

#[tokio::test]
async fn generator_runs_once_for_repeated_and_concurrent_requests() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("points.geojson");
    std::fs::write(&source_path, THREE_POINTS).unwrap();
    let fingerprint = fingerprint_source(&source_path).unwrap();

    let cache = Arc::new(CacheManager::new(&CacheConfig {
        disk_directory: dir.path().join("cache"),
        ..CacheConfig::default()
    }));
    let policy = ZoomPolicy::default().resolve(12);
    let key = CacheKey::new(LayerId(3), &policy, None);
    let calls = Arc::new(AtomicUsize::new(0));

    let generate = |calls: Arc<AtomicUsize>| {
        move |_sink: ProgressSink| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, GenerationError>(GeneratedPayload {
                body: Bytes::from_static(b"{\"type\":\"FeatureCollection\",\"features\":[]}"),
                meta: PayloadMeta {
                    total_features: 0,
                    returned_features: 0,
                    skipped_features: 0,
                    generated_at: "2026-01-01T00:00:00Z".to_string(),
                },
            })
        }
    };

    let (a, b) = tokio::join!(
        cache.get_or_generate(key.clone(), fingerprint.clone(), generate(calls.clone())),
        cache.get_or_generate(key.clone(), fingerprint.clone(), generate(calls.clone())),
    );
    let (_, status_a) = a.unwrap();
    let (_, status_b) = b.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let mut statuses = [status_a, status_b];
    statuses.sort_by_key(|status| status.header_value());
    assert_eq!(statuses, [CacheStatus::Miss, CacheStatus::Joined]);

    let (_, status) = cache
        .get_or_generate(key, fingerprint, generate(calls.clone()))
        .await
        .unwrap();
    assert_eq!(status, CacheStatus::MemoryHit);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn kml_placemark_without_geometry_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trails.kml");
    std::fs::write(&path, KML_ONE_BROKEN).unwrap();

    let (features, skipped): (Vec<_>, Vec<_>) =
        source::open(&path, SourceFormat::Kml).unwrap().partition(Result::is_ok);

    assert_eq!(features.len(), 1);
    assert_eq!(skipped.len(), 1);
    let feature = features.into_iter().next().unwrap().unwrap();
    assert_eq!(feature.properties["name"], "Trailhead");
}

#[tokio::test]
async fn kml_skip_count_reaches_info_block() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("trails.kml"), KML_ONE_BROKEN).unwrap();
    let layers = service(
        dir.path(),
        r#"
[[layers]]
id = 9
name = "Trails"
type = "kml"
source = "trails.kml"
"#,
    );

    let data = vector(
        layers
            .serve(LayerRequest::new(LayerId(9), 14))
            .await
            .unwrap(),
    );
    let json = body(&data);
    assert_eq!(json["info"]["returned_features"], 1);
    assert_eq!(json["info"]["skipped_features"], 1);
}

#[tokio::test]
async fn changed_source_is_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    let source_path: PathBuf = dir.path().join("points.geojson");
    std::fs::write(&source_path, THREE_POINTS).unwrap();
    let layers = service(
        dir.path(),
        r#"
[[layers]]
id = 4
name = "Survey points"
type = "geojson"
source = "points.geojson"
"#,
    );

    let first = vector(
        layers
            .serve(LayerRequest::new(LayerId(4), 10))
            .await
            .unwrap(),
    );
    assert_eq!(body(&first)["info"]["total_features"], 3);

    let single = r#"{"type":"FeatureCollection","features":[
        {"type":"Feature","id":1,"properties":{},"geometry":{"type":"Point","coordinates":[0.0,0.0]}}
    ]}"#;
    std::fs::write(&source_path, single).unwrap();

    let second = vector(
        layers
            .serve(LayerRequest::new(LayerId(4), 10))
            .await
            .unwrap(),
    );
    assert_eq!(second.status, CacheStatus::Miss);
    assert_eq!(body(&second)["info"]["total_features"], 1);
}

const ONE_POINT: &str = r#"{"type":"FeatureCollection","features":[
    {"type":"Feature","id":1,"properties":{},"geometry":{"type":"Point","coordinates":[0.0,0.0]}}
]}"#;

#[tokio::test]
async fn invalidation_downloads_remote_source_again() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(Mutex::new(THREE_POINTS));
    let url = serve_remote(remote.clone()).await;
    let layers = service(
        dir.path(),
        &format!(
            r#"
[[layers]]
id = 5
name = "County points"
type = "geojson"
source = "{url}"
"#
        ),
    );
    let request = || LayerRequest::new(LayerId(5), 10);

    let first = vector(layers.serve(request()).await.unwrap());
    assert_eq!(first.status, CacheStatus::Miss);
    assert_eq!(body(&first)["info"]["total_features"], 3);

    *remote.lock().unwrap() = ONE_POINT;

    // The download is reused until the layer is invalidated.
    let cached = vector(layers.serve(request()).await.unwrap());
    assert_eq!(body(&cached)["info"]["total_features"], 3);

    layers.invalidate_layer(LayerId(5)).await.unwrap();
    let refreshed = vector(layers.serve(request()).await.unwrap());
    assert_eq!(refreshed.status, CacheStatus::Miss);
    assert_eq!(body(&refreshed)["info"]["total_features"], 1);
}

#[tokio::test]
async fn stale_extractions_are_pruned() {
    use std::io::Write;

    use zip::{ZipWriter, write::SimpleFileOptions};

    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("points.zip");
    let write_bundle = |contents: &str| {
        let mut writer = ZipWriter::new(std::fs::File::create(&bundle).unwrap());
        writer
            .start_file("data/points.geojson", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
        writer.finish().unwrap();
    };
    write_bundle(THREE_POINTS);

    let staging = dir.path().join("staging");
    let layers = service(
        dir.path(),
        r#"
[[layers]]
id = 6
name = "Bundled points"
type = "geojson"
source = "points.zip"
"#,
    );
    let request = || LayerRequest::new(LayerId(6), 10);

    layers.serve(request()).await.unwrap();
    assert_eq!(extraction_dirs(&staging), 1);

    // A rewritten bundle replaces the old tree instead of adding one.
    write_bundle(ONE_POINT);
    let rewritten = vector(layers.serve(request()).await.unwrap());
    assert_eq!(body(&rewritten)["info"]["total_features"], 1);
    assert_eq!(extraction_dirs(&staging), 1);

    layers.invalidate_layer(LayerId(6)).await.unwrap();
    assert_eq!(extraction_dirs(&staging), 0);

    layers.serve(request()).await.unwrap();
    assert_eq!(extraction_dirs(&staging), 1);
    layers.clear_cache().await.unwrap();
    assert_eq!(extraction_dirs(&staging), 0);
    assert!(!staging.join("downloads").exists());
}
