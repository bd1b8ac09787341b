//! Layer serving orchestrator.
//!
//! Resolves the render policy for a request, consults the cache, and on a miss runs
//! the read, simplify, limit pipeline on the blocking pool. Progress is published
//! through the cache flight so every request attached to the same key sees it.

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::future::BoxFuture;
use metrics::histogram;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info, warn};

use super::{
    limiter::limit,
    repos::{LayerRepo, RepoError, SourceFetcher},
};
use crate::{
    cache::{
        CacheKey, CacheManager, CacheStatus, CachedPayload, GeneratedPayload, GenerationError,
        Lookup, PayloadMeta, Pending, ProgressSink, ProgressStream,
    },
    domain::{
        feature::Feature,
        layer::{Layer, LayerId, SourceFormat, sort_for_layer_control},
        policy::{RenderPolicy, ZoomPolicy},
        progress::{ProgressEvent, ProgressPhase},
    },
    geometry::{BoundingBox, encode_geometry, simplify},
    source::{self, Fingerprint, SourceError, fingerprint_source, prepare_source},
};

pub(crate) const METRIC_GENERATION_MS: &str = "parcelmap_generation_ms";

pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROGRESS_CHUNK_SIZE: usize = 1_000;

/// Runtime knobs of the generation pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How long a request waits before answering `202 Accepted`.
    pub generation_timeout: Duration,
    /// Features read between two reading progress events.
    pub progress_chunk_size: NonZeroUsize,
    /// Downloads and extracted archives.
    pub staging_directory: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
            progress_chunk_size: NonZeroUsize::new(DEFAULT_PROGRESS_CHUNK_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
            staging_directory: PathBuf::from("cache/staging"),
        }
    }
}

impl From<&crate::config::PipelineSettings> for PipelineConfig {
    fn from(settings: &crate::config::PipelineSettings) -> Self {
        Self {
            generation_timeout: settings.generation_timeout,
            progress_chunk_size: settings.progress_chunk_size,
            staging_directory: settings.staging_directory.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("layer {0} not found")]
    NotFound(LayerId),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Source(Arc<SourceError>),
    #[error("layer {layer_id} at zoom {zoom} still generating after {waited:?}")]
    Timeout {
        layer_id: LayerId,
        zoom: u8,
        waited: Duration,
    },
    #[error("cache maintenance failed: {0}")]
    Cache(#[from] std::io::Error),
    #[error("layer generation failed: {0}")]
    Internal(String),
}

impl From<SourceError> for ServeError {
    fn from(err: SourceError) -> Self {
        Self::Source(Arc::new(err))
    }
}

impl From<GenerationError> for ServeError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Source(source) => Self::Source(source),
            GenerationError::Internal(message) => Self::Internal(message),
        }
    }
}

/// A parsed data request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerRequest {
    pub layer_id: LayerId,
    pub zoom: i64,
    pub bbox: Option<BoundingBox>,
}

impl LayerRequest {
    pub fn new(layer_id: LayerId, zoom: i64) -> Self {
        Self {
            layer_id,
            zoom,
            bbox: None,
        }
    }

    pub fn with_bbox(mut self, bbox: Option<BoundingBox>) -> Self {
        self.bbox = bbox;
        self
    }
}

/// Layer entry of the layer control listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LayerSummary {
    pub id: LayerId,
    pub name: String,
    pub description: Option<String>,
    pub layer_type: &'static str,
    pub region_id: Option<i64>,
    pub z_index: i32,
    pub is_base_layer: bool,
    pub is_visible_by_default: bool,
    pub style: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl From<&Layer> for LayerSummary {
    fn from(layer: &Layer) -> Self {
        Self {
            id: layer.id,
            name: layer.name.clone(),
            description: layer.description.clone(),
            layer_type: layer.kind.type_name(),
            region_id: layer.region_id,
            z_index: layer.z_index,
            is_base_layer: layer.is_base_layer,
            is_visible_by_default: layer.is_visible_by_default,
            style: layer.style.clone(),
            url: layer.kind.remote_url().map(ToString::to_string),
        }
    }
}

/// What a WMS or tile layer hands to the client instead of features.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PassThrough {
    pub id: LayerId,
    pub name: String,
    pub layer_type: &'static str,
    pub url: String,
    pub style: Option<Value>,
}

impl PassThrough {
    fn from_layer(layer: &Layer) -> Self {
        Self {
            id: layer.id,
            name: layer.name.clone(),
            layer_type: layer.kind.type_name(),
            url: layer
                .kind
                .remote_url()
                .map(ToString::to_string)
                .unwrap_or_default(),
            style: layer.style.clone(),
        }
    }
}

/// The `info` block attached to every served collection.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LayerInfo {
    pub total_features: u64,
    pub returned_features: u64,
    pub skipped_features: u64,
    pub simplification_tolerance: f64,
    pub max_features: usize,
    pub zoom: u8,
    pub generated_at: String,
}

impl LayerInfo {
    fn new(meta: &PayloadMeta, policy: &RenderPolicy, zoom: u8) -> Self {
        Self {
            total_features: meta.total_features,
            returned_features: meta.returned_features,
            skipped_features: meta.skipped_features,
            simplification_tolerance: policy.tolerance,
            max_features: policy.max_features.get(),
            zoom,
            generated_at: meta.generated_at.clone(),
        }
    }
}

/// A serialized collection ready to be written to the client.
#[derive(Debug, Clone)]
pub struct VectorData {
    pub layer_id: LayerId,
    pub payload: Arc<CachedPayload>,
    pub status: CacheStatus,
    pub policy: RenderPolicy,
    pub zoom: u8,
}

impl VectorData {
    /// Summary for the requesting zoom; the body keeps the zoom it was generated at.
    pub fn info(&self) -> LayerInfo {
        LayerInfo::new(&self.payload.meta, &self.policy, self.zoom)
    }
}

#[derive(Debug, Clone)]
pub enum LayerData {
    Vector(VectorData),
    PassThrough(PassThrough),
}

/// A request attached to a generation that has not finished yet.
pub struct PendingLayer {
    pub layer_id: LayerId,
    pub zoom: u8,
    pub policy: RenderPolicy,
    pub pending: Pending,
}

impl PendingLayer {
    /// Split into the eventual layer data and the progress feed of the generation.
    pub fn into_parts(
        self,
    ) -> (
        BoxFuture<'static, Result<LayerData, ServeError>>,
        ProgressStream,
    ) {
        let Self {
            layer_id,
            zoom,
            policy,
            pending,
        } = self;
        let (result, progress) = pending.into_parts();
        let data = Box::pin(async move {
            let (payload, status) = result.await?;
            Ok::<_, ServeError>(LayerData::Vector(VectorData {
                layer_id,
                payload,
                status,
                policy,
                zoom,
            }))
        });
        (data, progress)
    }

    pub async fn wait(self) -> Result<LayerData, ServeError> {
        let (data, _progress) = self.into_parts();
        data.await
    }
}

pub enum Started {
    Ready(LayerData),
    Pending(PendingLayer),
}

/// Everything the blocking pipeline needs, detached from the request.
#[derive(Debug, Clone)]
struct GenerationJob {
    layer_id: LayerId,
    path: PathBuf,
    format: SourceFormat,
    staging: PathBuf,
    fingerprint: Fingerprint,
    policy: RenderPolicy,
    zoom: u8,
    bbox: Option<BoundingBox>,
    chunk_size: u64,
}

impl GenerationJob {
    fn run(self, sink: ProgressSink) -> Result<GeneratedPayload, GenerationError> {
        let started = Instant::now();
        let layer_id = self.layer_id;

        let source_path = prepare_source(&self.path, self.format, &self.staging, &self.fingerprint)?;
        let mut sequence = source::open(&source_path, self.format)?;
        let hint = sequence.total_feature_count();
        sink.emit(ProgressEvent::reading(layer_id, 0, hint));

        let mut kept: Vec<Feature> = Vec::with_capacity(hint.unwrap_or(0).min(1 << 20) as usize);
        let mut read: u64 = 0;
        let mut skipped: u64 = 0;
        for item in sequence.by_ref() {
            read += 1;
            match item {
                Ok(feature) => {
                    if self
                        .bbox
                        .as_ref()
                        .is_none_or(|bbox| bbox.intersects(&feature.geometry))
                    {
                        kept.push(feature);
                    }
                }
                Err(err) => {
                    skipped += 1;
                    debug!(layer_id = %layer_id, error = %err, "Skipping malformed record");
                }
            }
            if read % self.chunk_size == 0 {
                sink.emit(ProgressEvent::reading(layer_id, read, hint));
            }
        }
        let total = sequence.total_feature_count().unwrap_or(read);
        if skipped > 0 {
            warn!(layer_id = %layer_id, skipped, total, "Skipped malformed records");
        }

        sink.emit(ProgressEvent::phase(
            layer_id,
            ProgressPhase::Simplifying,
            read,
            Some(total),
        ));
        for feature in &mut kept {
            feature.geometry = simplify(&feature.geometry, self.policy.tolerance);
        }

        sink.emit(ProgressEvent::phase(
            layer_id,
            ProgressPhase::Limiting,
            read,
            Some(total),
        ));
        let limited = limit(kept, self.policy.max_features.get());

        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| GenerationError::Internal(err.to_string()))?;
        let meta = PayloadMeta {
            total_features: limited.total_count as u64,
            returned_features: limited.features.len() as u64,
            skipped_features: skipped,
            generated_at,
        };
        let body = encode_collection(
            limited.features,
            &LayerInfo::new(&meta, &self.policy, self.zoom),
        )?;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        histogram!(METRIC_GENERATION_MS).record(elapsed_ms);
        info!(
            layer_id = %layer_id,
            zoom = self.zoom,
            total = meta.total_features,
            returned = meta.returned_features,
            skipped = meta.skipped_features,
            bytes = body.len(),
            elapsed_ms = elapsed_ms as u64,
            "Generated layer payload"
        );
        sink.emit(ProgressEvent::phase(
            layer_id,
            ProgressPhase::Done,
            read,
            Some(total),
        ));

        Ok(GeneratedPayload { body, meta })
    }
}

fn encode_collection(features: Vec<Feature>, info: &LayerInfo) -> Result<Bytes, GenerationError> {
    let features: Vec<Value> = features
        .into_iter()
        .map(|feature| {
            json!({
                "type": "Feature",
                "id": feature.id.to_json(),
                "geometry": encode_geometry(&feature.geometry),
                "properties": Value::Object(feature.properties),
            })
        })
        .collect();
    let collection = json!({
        "type": "FeatureCollection",
        "features": features,
        "info": info,
    });
    serde_json::to_vec(&collection)
        .map(Bytes::from)
        .map_err(|err| GenerationError::Internal(err.to_string()))
}

/// Request-facing entry point to the pipeline; cheap to clone.
#[derive(Clone)]
pub struct LayerService {
    layers: Arc<dyn LayerRepo>,
    fetcher: Arc<dyn SourceFetcher>,
    cache: Arc<CacheManager>,
    policy: Arc<ZoomPolicy>,
    pipeline: PipelineConfig,
}

impl LayerService {
    pub fn new(
        layers: Arc<dyn LayerRepo>,
        fetcher: Arc<dyn SourceFetcher>,
        cache: Arc<CacheManager>,
        policy: ZoomPolicy,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            layers,
            fetcher,
            cache,
            policy: Arc::new(policy),
            pipeline,
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn policy(&self) -> &ZoomPolicy {
        &self.policy
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// Active layers offered in `region_id`, in layer control order.
    pub async fn list_layers(&self, region_id: Option<i64>) -> Result<Vec<LayerSummary>, ServeError> {
        let mut layers: Vec<Layer> = self
            .layers
            .list_layers()
            .await?
            .into_iter()
            .filter(|layer| layer.is_active && layer.visible_in_region(region_id))
            .collect();
        sort_for_layer_control(&mut layers);
        Ok(layers.iter().map(LayerSummary::from).collect())
    }

    async fn active_layer(&self, id: LayerId) -> Result<Layer, ServeError> {
        match self.layers.get_layer(id).await? {
            Some(layer) if layer.is_active => Ok(layer),
            Some(_) => {
                debug!(layer_id = %id, "Layer is inactive");
                Err(ServeError::NotFound(id))
            }
            None => Err(ServeError::NotFound(id)),
        }
    }

    /// Resolve the request up to the cache lookup without waiting for generation.
    pub async fn start(&self, request: LayerRequest) -> Result<Started, ServeError> {
        let layer = self.active_layer(request.layer_id).await?;
        let Some((locator, format)) = layer.kind.vector_source() else {
            return Ok(Started::Ready(LayerData::PassThrough(
                PassThrough::from_layer(&layer),
            )));
        };

        let zoom = ZoomPolicy::clamp_zoom(request.zoom);
        let policy = self.policy.resolve(request.zoom);
        let key = CacheKey::new(layer.id, &policy, request.bbox.as_ref());

        let path = self.fetcher.materialize(locator).await?;
        let fingerprint = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || fingerprint_source(&path))
                .await
                .map_err(|err| ServeError::Internal(err.to_string()))??
        };

        let job = GenerationJob {
            layer_id: layer.id,
            path,
            format,
            staging: self.pipeline.staging_directory.clone(),
            fingerprint: fingerprint.clone(),
            policy,
            zoom,
            bbox: request.bbox,
            chunk_size: self.pipeline.progress_chunk_size.get() as u64,
        };
        let lookup = self.cache.begin(key, fingerprint, move |sink| async move {
            tokio::task::spawn_blocking(move || job.run(sink))
                .await
                .unwrap_or_else(|err| Err(GenerationError::Internal(err.to_string())))
        });

        Ok(match lookup {
            Lookup::Ready { payload, status } => Started::Ready(LayerData::Vector(VectorData {
                layer_id: layer.id,
                payload,
                status,
                policy,
                zoom,
            })),
            Lookup::Pending(pending) => Started::Pending(PendingLayer {
                layer_id: layer.id,
                zoom,
                policy,
                pending,
            }),
        })
    }

    /// Serve a request, giving up with [`ServeError::Timeout`] after the configured wait.
    ///
    /// A timed out generation keeps running and lands in the cache for the next request.
    pub async fn serve(&self, request: LayerRequest) -> Result<LayerData, ServeError> {
        match self.start(request).await? {
            Started::Ready(data) => Ok(data),
            Started::Pending(pending) => self.wait(pending).await,
        }
    }

    /// Serve a request and wait for generation however long it takes.
    pub async fn generate(&self, request: LayerRequest) -> Result<LayerData, ServeError> {
        match self.start(request).await? {
            Started::Ready(data) => Ok(data),
            Started::Pending(pending) => pending.wait().await,
        }
    }

    async fn wait(&self, pending: PendingLayer) -> Result<LayerData, ServeError> {
        let layer_id = pending.layer_id;
        let zoom = pending.zoom;
        let waited = self.pipeline.generation_timeout;
        match tokio::time::timeout(waited, pending.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    layer_id = %layer_id,
                    zoom,
                    waited_ms = waited.as_millis() as u64,
                    "Generation still running; answering before it completes"
                );
                Err(ServeError::Timeout {
                    layer_id,
                    zoom,
                    waited,
                })
            }
        }
    }

    /// Drop the cached payloads of one known layer, along with its staged download and
    /// extracted archive, so the next request reads the source afresh.
    pub async fn invalidate_layer(&self, id: LayerId) -> Result<(), ServeError> {
        let Some(layer) = self.layers.get_layer(id).await? else {
            return Err(ServeError::NotFound(id));
        };
        self.cache.invalidate_layer(id).await?;

        if let Some((locator, _)) = layer.kind.vector_source() {
            let staged = self.fetcher.release(locator).await?;
            let staging = self.pipeline.staging_directory.clone();
            let removed =
                tokio::task::spawn_blocking(move || source::remove_extractions(&staging, &staged))
                    .await
                    .map_err(|err| ServeError::Internal(err.to_string()))??;
            debug!(layer_id = %id, removed, "Released staged source");
        }
        Ok(())
    }

    /// Drop every cached payload and everything staged for the readers.
    pub async fn clear_cache(&self) -> Result<(), ServeError> {
        self.cache.clear().await?;
        self.fetcher.release_all().await?;

        let staging = self.pipeline.staging_directory.clone();
        let removed = tokio::task::spawn_blocking(move || source::remove_all_extractions(&staging))
            .await
            .map_err(|err| ServeError::Internal(err.to_string()))??;
        debug!(removed, "Cleared staged extractions");
        Ok(())
    }
}
