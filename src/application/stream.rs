//! Server-sent progress for layer generation.
//!
//! A stream carries any number of `progress` events followed by exactly one `ready`
//! or `error` event.

use std::convert::Infallible;

use async_stream::stream;
use axum::response::{
    IntoResponse, Response,
    sse::{Event, KeepAlive, Sse},
};
use serde::Serialize;
use serde_json::json;

use super::serving::{LayerData, ServeError, Started};
use crate::domain::progress::ProgressEvent;

pub const EVENT_PROGRESS: &str = "progress";
pub const EVENT_READY: &str = "ready";
pub const EVENT_ERROR: &str = "error";

fn json_event(name: &'static str, value: &impl Serialize) -> Event {
    let data = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(name).data(data)
}

pub fn progress_event(event: &ProgressEvent) -> Event {
    json_event(EVENT_PROGRESS, event)
}

pub fn ready_event(data: &LayerData) -> Event {
    let body = match data {
        LayerData::Vector(vector) => json!({
            "layer_id": vector.layer_id,
            "cache": vector.status.header_value(),
            "bytes": vector.payload.len(),
            "info": vector.info(),
        }),
        LayerData::PassThrough(descriptor) => json!({
            "layer_id": descriptor.id,
            "pass_through": descriptor,
        }),
    };
    json_event(EVENT_READY, &body)
}

/// Whether asking again later may succeed.
pub fn is_retryable(err: &ServeError) -> bool {
    match err {
        ServeError::Timeout { .. } | ServeError::Internal(_) | ServeError::Cache(_) => true,
        ServeError::Source(source) => source.is_unavailable(),
        ServeError::NotFound(_) | ServeError::Repo(_) => false,
    }
}

pub fn error_event(err: &ServeError) -> Event {
    json_event(
        EVENT_ERROR,
        &json!({
            "message": err.to_string(),
            "retryable": is_retryable(err),
        }),
    )
}

fn outcome_event(outcome: Result<LayerData, ServeError>) -> Event {
    match outcome {
        Ok(data) => ready_event(&data),
        Err(err) => error_event(&err),
    }
}

enum Step {
    Progress(ProgressEvent),
    Finished(Result<LayerData, ServeError>),
    Closed,
}

/// Stream progress of `started` until its payload is ready.
///
/// The stream waits for generation without a deadline; closing it does not cancel
/// the generation.
pub fn layer_events(started: Result<Started, ServeError>) -> Response {
    let stream = stream! {
        match started {
            Err(err) => {
                yield Ok::<Event, Infallible>(error_event(&err));
            }
            Ok(Started::Ready(data)) => {
                yield Ok(ready_event(&data));
            }
            Ok(Started::Pending(layer)) => {
                let (mut result, mut progress) = layer.into_parts();
                loop {
                    let step = tokio::select! {
                        biased;
                        event = progress.next() => match event {
                            Some(event) => Step::Progress(event),
                            None => Step::Closed,
                        },
                        outcome = &mut result => Step::Finished(outcome),
                    };
                    match step {
                        Step::Progress(event) => {
                            yield Ok(progress_event(&event));
                        }
                        Step::Finished(outcome) => {
                            yield Ok(outcome_event(outcome));
                            break;
                        }
                        Step::Closed => {
                            // Progress ends when the generation task drops its sender.
                            let outcome = (&mut result).await;
                            yield Ok(outcome_event(outcome));
                            break;
                        }
                    }
                }
            }
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc, time::Duration};

    use super::*;
    use crate::{domain::layer::LayerId, source::SourceError};

    #[test]
    fn retry_classification() {
        let unavailable = ServeError::Source(Arc::new(SourceError::unavailable(
            "https://example.com/parcels.zip",
            "connection reset",
        )));
        assert!(is_retryable(&unavailable));

        let format = ServeError::Source(Arc::new(SourceError::format("a.shp", "bad header")));
        assert!(!is_retryable(&format));

        let timeout = ServeError::Timeout {
            layer_id: LayerId(1),
            zoom: 9,
            waited: Duration::from_secs(60),
        };
        assert!(is_retryable(&timeout));
        assert!(is_retryable(&ServeError::Cache(io::Error::other("busy"))));
        assert!(!is_retryable(&ServeError::NotFound(LayerId(1))));
    }
}
