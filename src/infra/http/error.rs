use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{
    application::{error::ErrorReport, serving::ServeError},
    source::SourceError,
};

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const GENERATING: &str = "generating";
    pub const SOURCE_FORMAT: &str = "source_format";
    pub const SOURCE_UNAVAILABLE: &str = "source_unavailable";
    pub const REPO: &str = "repo_error";
    pub const CACHE: &str = "cache_error";
    pub const INTERNAL: &str = "internal_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    retry_after: Option<u64>,
    chain: Vec<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            retry_after: None,
            chain: Vec::new(),
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn not_found(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, None)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn with_chain(mut self, err: &dyn std::error::Error) -> Self {
        self.chain = ErrorReport::from_error("infra::http", self.status, err).messages;
        self
    }
}

impl From<ServeError> for ApiError {
    fn from(err: ServeError) -> Self {
        let mapped = match &err {
            ServeError::NotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                codes::NOT_FOUND,
                "Layer not found",
                Some(format!("no active layer with id {id}")),
            ),
            ServeError::Timeout { waited, .. } => Self::new(
                StatusCode::ACCEPTED,
                codes::GENERATING,
                "Layer is still being generated",
                Some("Zoom in to request fewer features, or retry shortly".to_string()),
            )
            .with_retry_after(waited.as_secs().clamp(1, 30)),
            ServeError::Source(source) => match source.as_ref() {
                SourceError::Format { .. } => Self::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    codes::SOURCE_FORMAT,
                    "Could not read layer",
                    Some(source.to_string()),
                ),
                SourceError::Unavailable { .. } => Self::new(
                    StatusCode::BAD_GATEWAY,
                    codes::SOURCE_UNAVAILABLE,
                    "Layer source unavailable",
                    Some(source.to_string()),
                ),
            },
            ServeError::Repo(repo) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::REPO,
                "Layer catalog error",
                Some(repo.to_string()),
            ),
            ServeError::Cache(io) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::CACHE,
                "Cache maintenance failed",
                Some(io.to_string()),
            ),
            ServeError::Internal(message) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::INTERNAL,
                "Layer generation failed",
                Some(message.clone()),
            ),
        };
        mapped.with_chain(&err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = if self.chain.is_empty() {
            ErrorReport::from_message(
                "infra::http",
                self.status,
                format!(
                    "{}: {}",
                    self.code,
                    self.hint.as_deref().unwrap_or(self.message)
                ),
            )
        } else {
            ErrorReport {
                source: "infra::http",
                status: self.status,
                messages: self.chain,
            }
        };

        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(value) = self
            .retry_after
            .and_then(|seconds| HeaderValue::from_str(&seconds.to_string()).ok())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        // Shared logging middleware reads this for diagnostics.
        report.attach(&mut response);
        response
    }
}
