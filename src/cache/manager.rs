//! Two-tier cache manager with request collapsing.
//!
//! Lookup order is memory, then disk, then generation. Disk reads and generation
//! both run inside a detached task owned by the first request for a key; later
//! requests for the same key attach to that task instead of starting their own.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::FutureExt;
use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    config::CacheConfig,
    disk::DiskTier,
    flight::{
        CacheStatus, Flight, FlightGuard, FlightMap, GenerationError, Origin, PROGRESS_CAPACITY,
        Pending, ProgressSink,
    },
    keys::CacheKey,
    memory::{MemoryInsert, MemoryTier},
    payload::{CachedPayload, GeneratedPayload},
};
use crate::{domain::layer::LayerId, source::Fingerprint};

pub(crate) const METRIC_MEMORY_HIT: &str = "parcelmap_cache_memory_hit_total";
pub(crate) const METRIC_DISK_HIT: &str = "parcelmap_cache_disk_hit_total";
pub(crate) const METRIC_MISS: &str = "parcelmap_cache_miss_total";
pub(crate) const METRIC_COALESCED: &str = "parcelmap_cache_coalesced_total";
pub(crate) const METRIC_WRITE_ERROR: &str = "parcelmap_cache_write_error_total";

/// Result of starting a lookup.
pub enum Lookup {
    Ready {
        payload: Arc<CachedPayload>,
        status: CacheStatus,
    },
    Pending(Pending),
}

pub struct CacheManager {
    memory: MemoryTier,
    disk: DiskTier,
    flights: FlightMap,
    next_flight: AtomicU64,
}

impl CacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            memory: MemoryTier::new(config),
            disk: DiskTier::new(config.disk_directory.clone(), config.disk_enabled),
            flights: Arc::new(DashMap::new()),
            next_flight: AtomicU64::new(1),
        }
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    /// Number of generations currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Memory hit for `key` if its fingerprint still matches; stale entries are dropped.
    fn memory_hit(&self, key: &CacheKey, fingerprint: &Fingerprint) -> Option<Arc<CachedPayload>> {
        let payload = self.memory.get(key)?;
        if &payload.fingerprint == fingerprint {
            return Some(payload);
        }
        info!(
            key = %key,
            cached = %payload.fingerprint.short(),
            current = %fingerprint.short(),
            "Source changed; dropping cached payload"
        );
        self.memory.remove(key);
        None
    }

    /// Return a cached payload or attach to the generation that will produce it.
    ///
    /// At most one generation per key runs at a time. It is spawned on the runtime and
    /// keeps running when every waiting request has gone away.
    pub fn begin<G, Fut>(self: &Arc<Self>, key: CacheKey, fingerprint: Fingerprint, generator: G) -> Lookup
    where
        G: FnOnce(ProgressSink) -> Fut + Send + 'static,
        Fut: Future<Output = Result<GeneratedPayload, GenerationError>> + Send + 'static,
    {
        if let Some(payload) = self.memory_hit(&key, &fingerprint) {
            counter!(METRIC_MEMORY_HIT).increment(1);
            return Lookup::Ready {
                payload,
                status: CacheStatus::MemoryHit,
            };
        }

        match self.flights.entry(key.clone()) {
            Entry::Occupied(occupied) if occupied.get().fingerprint == fingerprint => {
                counter!(METRIC_COALESCED).increment(1);
                debug!(key = %key, "Joining in-flight generation");
                Lookup::Pending(Pending::joined(occupied.get()))
            }
            Entry::Occupied(mut occupied) => {
                // The running flight reads an older source; its result fails the
                // fingerprint check on the next hit.
                info!(
                    key = %key,
                    running = %occupied.get().fingerprint.short(),
                    current = %fingerprint.short(),
                    "Source changed during generation; starting a fresh one"
                );
                let (flight, pending) = self.launch(key, fingerprint, generator);
                occupied.insert(flight);
                Lookup::Pending(pending)
            }
            Entry::Vacant(vacant) => {
                // A flight may have finished between the first check and taking the entry.
                if let Some(payload) = self.memory_hit(&key, &fingerprint) {
                    counter!(METRIC_MEMORY_HIT).increment(1);
                    return Lookup::Ready {
                        payload,
                        status: CacheStatus::MemoryHit,
                    };
                }

                let (flight, pending) = self.launch(key, fingerprint, generator);
                vacant.insert(flight);
                Lookup::Pending(pending)
            }
        }
    }

    /// Spawn the generation for `key`; the caller registers the returned flight.
    fn launch<G, Fut>(
        self: &Arc<Self>,
        key: CacheKey,
        fingerprint: Fingerprint,
        generator: G,
    ) -> (Flight, Pending)
    where
        G: FnOnce(ProgressSink) -> Fut + Send + 'static,
        Fut: Future<Output = Result<GeneratedPayload, GenerationError>> + Send + 'static,
    {
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(PROGRESS_CAPACITY);
        let guard = FlightGuard {
            key: key.clone(),
            id,
            flights: Arc::clone(&self.flights),
        };
        let sink = ProgressSink::new(tx.clone());
        let manager = Arc::clone(self);
        let generation_fingerprint = fingerprint.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            manager
                .fill(key, generation_fingerprint, generator, sink)
                .await
        });
        let result = async move {
            handle
                .await
                .map_err(|err| GenerationError::Internal(err.to_string()))?
        }
        .boxed()
        .shared();

        let pending = Pending::leader(result.clone(), rx);
        let flight = Flight {
            id,
            fingerprint,
            result,
            progress: tx,
        };
        (flight, pending)
    }

    /// Cached payload for `key`, generating it when neither tier has a fresh copy.
    pub async fn get_or_generate<G, Fut>(
        self: &Arc<Self>,
        key: CacheKey,
        fingerprint: Fingerprint,
        generator: G,
    ) -> Result<(Arc<CachedPayload>, CacheStatus), GenerationError>
    where
        G: FnOnce(ProgressSink) -> Fut + Send + 'static,
        Fut: Future<Output = Result<GeneratedPayload, GenerationError>> + Send + 'static,
    {
        match self.begin(key, fingerprint, generator) {
            Lookup::Ready { payload, status } => Ok((payload, status)),
            Lookup::Pending(pending) => pending.wait().await,
        }
    }

    async fn fill<G, Fut>(
        &self,
        key: CacheKey,
        fingerprint: Fingerprint,
        generator: G,
        sink: ProgressSink,
    ) -> Result<(Arc<CachedPayload>, Origin), GenerationError>
    where
        G: FnOnce(ProgressSink) -> Fut,
        Fut: Future<Output = Result<GeneratedPayload, GenerationError>>,
    {
        if let Some(stored) = self.disk.read(&key).await {
            if stored.fingerprint == fingerprint {
                counter!(METRIC_DISK_HIT).increment(1);
                let payload = Arc::new(stored);
                self.store_in_memory(&key, &payload);
                return Ok((payload, Origin::Disk));
            }
            info!(key = %key, "Source changed; dropping cached file");
            self.disk.remove(&key).await;
        }

        counter!(METRIC_MISS).increment(1);
        let generated = generator(sink).await?;
        let payload = Arc::new(CachedPayload {
            body: generated.body,
            meta: generated.meta,
            fingerprint,
        });

        if let Err(err) = self.disk.write(&key, &payload).await {
            counter!(METRIC_WRITE_ERROR).increment(1);
            warn!(
                key = %key,
                error = %err,
                "Failed to persist generated payload; serving from memory only"
            );
        }
        self.store_in_memory(&key, &payload);

        Ok((payload, Origin::Generated))
    }

    fn store_in_memory(&self, key: &CacheKey, payload: &Arc<CachedPayload>) {
        if self.memory.insert(key.clone(), Arc::clone(payload)) == MemoryInsert::TooLarge {
            debug!(key = %key, bytes = payload.len(), "Payload above memory entry limit; kept on disk only");
        }
    }

    /// Drop every cached payload of one layer from both tiers.
    pub async fn invalidate_layer(&self, layer_id: LayerId) -> std::io::Result<()> {
        let removed = self.memory.remove_layer(layer_id);
        self.disk.remove_layer(layer_id).await?;
        info!(layer_id = %layer_id, memory_entries = removed, "Invalidated layer cache");
        Ok(())
    }

    /// Drop everything from both tiers.
    pub async fn clear(&self) -> std::io::Result<()> {
        self.memory.clear();
        self.disk.clear().await?;
        info!("Cleared layer cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    use bytes::Bytes;

    use super::*;
    use crate::{
        cache::payload::PayloadMeta,
        domain::{
            policy::RenderPolicy,
            progress::{ProgressEvent, ProgressPhase},
        },
        source::SourceError,
    };

    fn key(layer: i64) -> CacheKey {
        let policy = RenderPolicy {
            tolerance: 0.002,
            max_features: NonZeroUsize::new(15_000).unwrap(),
            memory_ttl: Duration::from_secs(3_600),
        };
        CacheKey::new(LayerId(layer), &policy, None)
    }

    fn manager(dir: &std::path::Path) -> Arc<CacheManager> {
        Arc::new(CacheManager::new(&CacheConfig {
            disk_directory: dir.to_path_buf(),
            ..CacheConfig::default()
        }))
    }

    fn generated(body: &str) -> GeneratedPayload {
        GeneratedPayload {
            body: Bytes::from(body.to_string()),
            meta: PayloadMeta {
                total_features: 1,
                returned_features: 1,
                skipped_features: 0,
                generated_at: "2026-01-01T00:00:00Z".into(),
            },
        }
    }

    fn counting_generator(
        calls: Arc<AtomicUsize>,
        body: &'static str,
    ) -> impl FnOnce(ProgressSink) -> futures::future::BoxFuture<'static, Result<GeneratedPayload, GenerationError>>
    + Send
    + 'static {
        move |_sink| {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(generated(body))
            })
        }
    }

    #[tokio::test]
    async fn miss_then_memory_hit_then_disk_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = Fingerprint::from("v1");

        let (first, status) = cache
            .get_or_generate(key(1), fp.clone(), counting_generator(calls.clone(), "one"))
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(first.body, "one");

        let (_, status) = cache
            .get_or_generate(key(1), fp.clone(), counting_generator(calls.clone(), "two"))
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::MemoryHit);

        cache.memory().clear();
        let (again, status) = cache
            .get_or_generate(key(1), fp, counting_generator(calls.clone(), "three"))
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::DiskHit);
        assert_eq!(again.body, "one");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_generation() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_generate(key(7), Fingerprint::from("v1"), counting_generator(calls, "shared"))
                    .await
                    .unwrap()
            }));
        }

        let mut statuses = Vec::new();
        for task in tasks {
            let (payload, status) = task.await.unwrap();
            assert_eq!(payload.body, "shared");
            statuses.push(status);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            statuses.iter().filter(|s| **s == CacheStatus::Miss).count(),
            1
        );
    }

    #[tokio::test]
    async fn fingerprint_change_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_generate(key(1), Fingerprint::from("v1"), counting_generator(calls.clone(), "old"))
            .await
            .unwrap();
        let (payload, status) = cache
            .get_or_generate(key(1), Fingerprint::from("v2"), counting_generator(calls.clone(), "new"))
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(payload.body, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.memory().clear();
        let (payload, status) = cache
            .get_or_generate(key(1), Fingerprint::from("v2"), counting_generator(calls.clone(), "unused"))
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::DiskHit);
        assert_eq!(payload.body, "new");
    }

    #[tokio::test]
    async fn changed_source_does_not_join_older_flight() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        let old = cache.begin(
            key(5),
            Fingerprint::from("v1"),
            counting_generator(calls.clone(), "old"),
        );
        let new = cache.begin(
            key(5),
            Fingerprint::from("v2"),
            counting_generator(calls.clone(), "new"),
        );
        let (Lookup::Pending(old), Lookup::Pending(new)) = (old, new) else {
            panic!("expected two pending lookups");
        };
        assert!(new.is_leader());

        let (payload, status) = new.wait().await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(payload.body, "new");
        let (payload, _) = old.wait().await.unwrap();
        assert_eq!(payload.body, "old");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Whichever finished last, the stale payload never satisfies the new fingerprint.
        let (payload, _) = cache
            .get_or_generate(key(5), Fingerprint::from("v2"), counting_generator(calls.clone(), "again"))
            .await
            .unwrap();
        assert_ne!(payload.body, "old");
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());

        let err = cache
            .get_or_generate(key(3), Fingerprint::from("v1"), |_sink| async {
                Err(GenerationError::from(SourceError::format("x.geojson", "broken")))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Source(_)));
        assert!(cache.memory().is_empty());
        assert!(cache.disk().read(&key(3)).await.is_none());
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_generator_releases_the_flight() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());

        let err = cache
            .get_or_generate(key(4), Fingerprint::from("v1"), |_sink| async {
                if true {
                    panic!("generator blew up");
                }
                Ok(generated("never"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Internal(_)));
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn disk_write_failure_still_serves() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let cache = manager(&blocker);

        let (payload, status) = cache
            .get_or_generate(key(1), Fingerprint::from("v1"), |_sink| async {
                Ok(generated("body"))
            })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(payload.body, "body");
        assert!(cache.memory().get(&key(1)).is_some());
    }

    #[tokio::test]
    async fn progress_reaches_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());

        let lookup = cache.begin(key(9), Fingerprint::from("v1"), |sink| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sink.emit(ProgressEvent::phase(LayerId(9), ProgressPhase::Limiting, 5, Some(5)));
            Ok(generated("done"))
        });
        let Lookup::Pending(pending) = lookup else {
            panic!("expected a pending lookup");
        };
        assert!(pending.is_leader());

        let (result, mut progress) = pending.into_parts();
        let event = progress.next().await.unwrap();
        assert_eq!(event.phase, ProgressPhase::Limiting);
        let (_, status) = result.await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn invalidation_clears_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        for layer in [1, 2] {
            cache
                .get_or_generate(key(layer), Fingerprint::from("v1"), |_sink| async {
                    Ok(generated("x"))
                })
                .await
                .unwrap();
        }

        cache.invalidate_layer(LayerId(1)).await.unwrap();
        assert!(cache.memory().get(&key(1)).is_none());
        assert!(cache.disk().read(&key(1)).await.is_none());
        assert!(cache.disk().read(&key(2)).await.is_some());

        cache.clear().await.unwrap();
        assert!(cache.memory().is_empty());
        assert!(cache.disk().read(&key(2)).await.is_none());
    }
}
