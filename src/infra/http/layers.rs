use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{
        HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

use super::{ServingState, error::ApiError};
use crate::{
    application::{
        serving::{LayerData, LayerRequest, VectorData},
        stream::layer_events,
    },
    domain::layer::LayerId,
    geometry::BoundingBox,
};

pub const X_CACHE: &str = "x-cache";

const CACHE_CONTROL_ZOOMED: &str = "public, max-age=1800";
const CACHE_CONTROL_UNZOOMED: &str = "public, max-age=3600";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ListQuery {
    region_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct DataQuery {
    zoom: Option<String>,
    bbox: Option<String>,
}

impl DataQuery {
    /// Zoom defaults to the coarsest tier when absent.
    fn into_request(self, layer_id: LayerId) -> Result<(LayerRequest, bool), ApiError> {
        let zoom = match self.zoom.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                ApiError::bad_request(
                    "Invalid zoom",
                    Some(format!("`{raw}` is not an integer zoom level")),
                )
            })?),
            None => None,
        };

        let bbox = match self.bbox.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => Some(BoundingBox::parse(raw).ok_or_else(|| {
                ApiError::bad_request(
                    "Invalid bbox",
                    Some("expected `minx,miny,maxx,maxy` with min below max".to_string()),
                )
            })?),
            None => None,
        };

        let request = LayerRequest::new(layer_id, zoom.unwrap_or(0)).with_bbox(bbox);
        Ok((request, zoom.is_some()))
    }
}

pub(super) async fn list_layers(
    State(state): State<ServingState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let region_id = match query.region_id.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => match raw.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                return ApiError::bad_request(
                    "Invalid region_id",
                    Some(format!("`{raw}` is not an integer id")),
                )
                .into_response();
            }
        },
        None => None,
    };

    match state.layers.list_layers(region_id).await {
        Ok(layers) => Json(layers).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

pub(super) async fn layer_data(
    State(state): State<ServingState>,
    Path(id): Path<i64>,
    Query(query): Query<DataQuery>,
) -> Response {
    let (request, zoomed) = match query.into_request(LayerId(id)) {
        Ok(parsed) => parsed,
        Err(err) => return err.into_response(),
    };

    match state.layers.serve(request).await {
        Ok(LayerData::Vector(data)) => vector_response(&data, zoomed),
        Ok(LayerData::PassThrough(descriptor)) => Json(descriptor).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

pub(super) async fn layer_data_events(
    State(state): State<ServingState>,
    Path(id): Path<i64>,
    Query(query): Query<DataQuery>,
) -> Response {
    let (request, _) = match query.into_request(LayerId(id)) {
        Ok(parsed) => parsed,
        Err(err) => return err.into_response(),
    };

    layer_events(state.layers.start(request).await)
}

pub(super) async fn invalidate_layer_cache(
    State(state): State<ServingState>,
    Path(id): Path<i64>,
) -> Response {
    match state.layers.invalidate_layer(LayerId(id)).await {
        Ok(()) => {
            info!(layer_id = id, "Layer cache invalidated");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

pub(super) async fn clear_cache(State(state): State<ServingState>) -> Response {
    match state.layers.clear_cache().await {
        Ok(()) => {
            info!("Layer cache cleared");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

fn vector_response(data: &VectorData, zoomed: bool) -> Response {
    let body = data.payload.body.clone();
    let length = body.len();
    let mut response = Response::new(Body::from(body));

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static(if zoomed {
            CACHE_CONTROL_ZOOMED
        } else {
            CACHE_CONTROL_UNZOOMED
        }),
    );
    headers.insert(X_CACHE, HeaderValue::from_static(data.status.header_value()));
    if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }

    response
}
