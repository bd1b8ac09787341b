mod error;
mod layers;
mod middleware;

pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, codes};
pub use layers::X_CACHE;
pub use middleware::RequestContext;

use axum::{
    Router,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{delete, get},
};

use crate::application::serving::LayerService;
use middleware::{log_responses, set_request_context};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ServingState {
    pub layers: LayerService,
}

impl ServingState {
    pub fn new(layers: LayerService) -> Self {
        Self { layers }
    }
}

pub fn build_router(state: ServingState) -> Router {
    Router::new()
        .route("/api/layers", get(layers::list_layers))
        .route("/api/layers/{id}/data", get(layers::layer_data))
        .route("/api/layers/{id}/data/events", get(layers::layer_data_events))
        .route("/api/layers/{id}/cache", delete(layers::invalidate_layer_cache))
        .route("/api/cache", delete(layers::clear_cache))
        .route("/_health", get(health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
