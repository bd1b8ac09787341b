use std::{collections::HashSet, num::NonZeroU32, path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use metrics_util::debugging::DebuggingRecorder;
use parcelmap::{
    application::serving::{LayerRequest, LayerService, PipelineConfig},
    cache::{
        CacheConfig, CacheKey, CacheManager, GeneratedPayload, GenerationError, PayloadMeta,
        ProgressSink,
    },
    config::RemoteSettings,
    domain::{layer::LayerId, policy::ZoomPolicy},
    infra::{catalog::LayerCatalog, fetch::HttpFetcher, telemetry},
    source::fingerprint_source,
};

const POINTS: &str = r#"{"type":"FeatureCollection","features":[
  {"type":"Feature","id":1,"properties":{},"geometry":{"type":"Point","coordinates":[1.0,1.0]}},
  {"type":"Feature","id":2,"properties":{},"geometry":{"type":"Point","coordinates":[2.0,2.0]}}
]}"#;

const CATALOG: &str = r#"
[[layers]]
id = 1
name = "Points"
type = "geojson"
source = "points.geojson"
"#;

fn service(root: &Path, cache: CacheConfig) -> LayerService {
    let remote = RemoteSettings {
        max_attempts: NonZeroU32::new(1).expect("non-zero"),
        initial_backoff: Duration::from_millis(1),
        request_timeout: Duration::from_secs(1),
    };
    LayerService::new(
        Arc::new(LayerCatalog::from_toml_str(CATALOG, Some(root)).expect("catalog")),
        Arc::new(HttpFetcher::new(&remote, &root.join("staging")).expect("fetcher")),
        Arc::new(CacheManager::new(&cache)),
        ZoomPolicy::default(),
        PipelineConfig {
            staging_directory: root.join("staging"),
            ..PipelineConfig::default()
        },
    )
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("points.geojson"), POINTS).expect("write source");

    // Miss, memory hit, then eviction by a second tier's payload.
    let cache = CacheConfig {
        memory_max_entries: 1,
        disk_directory: dir.path().join("cache"),
        ..CacheConfig::default()
    };
    let layers = service(dir.path(), cache.clone());
    for zoom in [10, 10, 16] {
        layers
            .serve(LayerRequest::new(LayerId(1), zoom))
            .await
            .expect("serve");
    }

    // A fresh manager over the same directory reads the disk tier.
    let restarted = service(dir.path(), cache);
    restarted
        .serve(LayerRequest::new(LayerId(1), 10))
        .await
        .expect("disk hit");

    // Concurrent lookups of a cold key share one generation.
    let manager = Arc::new(CacheManager::new(&CacheConfig {
        disk_enabled: false,
        ..CacheConfig::default()
    }));
    let fingerprint = fingerprint_source(&dir.path().join("points.geojson")).expect("fingerprint");
    let key = CacheKey::new(LayerId(1), &ZoomPolicy::default().resolve(12), None);
    let slow = |_sink: ProgressSink| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, GenerationError>(GeneratedPayload {
            body: Bytes::from_static(b"{}"),
            meta: PayloadMeta {
                total_features: 0,
                returned_features: 0,
                skipped_features: 0,
                generated_at: "2026-01-01T00:00:00Z".to_string(),
            },
        })
    };
    let (a, b) = tokio::join!(
        manager.get_or_generate(key.clone(), fingerprint.clone(), slow),
        manager.get_or_generate(key, fingerprint, slow),
    );
    a.expect("first");
    b.expect("second");

    // A disk directory that is really a file makes every write fail.
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"not a directory").expect("write blocker");
    let unwritable = service(
        dir.path(),
        CacheConfig {
            disk_directory: blocked,
            ..CacheConfig::default()
        },
    );
    unwritable
        .serve(LayerRequest::new(LayerId(1), 8))
        .await
        .expect("served from memory despite write failure");

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "parcelmap_cache_memory_hit_total",
        "parcelmap_cache_disk_hit_total",
        "parcelmap_cache_miss_total",
        "parcelmap_cache_coalesced_total",
        "parcelmap_cache_memory_evict_total",
        "parcelmap_cache_write_error_total",
        "parcelmap_generation_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
