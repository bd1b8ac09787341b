use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    application::serving::METRIC_GENERATION_MS,
    cache::{
        METRIC_COALESCED, METRIC_DISK_HIT, METRIC_MEMORY_EVICT, METRIC_MEMORY_HIT, METRIC_MISS,
        METRIC_WRITE_ERROR,
    },
    config::{LogFormat, LoggingSettings},
};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the service records.
///
/// Safe to call repeatedly; only the first call registers.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_MEMORY_HIT,
            Unit::Count,
            "Layer payloads served from the in-memory tier."
        );
        describe_counter!(
            METRIC_DISK_HIT,
            Unit::Count,
            "Layer payloads loaded from the disk tier."
        );
        describe_counter!(
            METRIC_MISS,
            Unit::Count,
            "Layer payloads that had to be generated."
        );
        describe_counter!(
            METRIC_COALESCED,
            Unit::Count,
            "Requests that joined a generation already in flight."
        );
        describe_counter!(
            METRIC_MEMORY_EVICT,
            Unit::Count,
            "In-memory payloads evicted to stay within entry or byte bounds."
        );
        describe_counter!(
            METRIC_WRITE_ERROR,
            Unit::Count,
            "Generated payloads that could not be written to disk."
        );
        describe_histogram!(
            METRIC_GENERATION_MS,
            Unit::Milliseconds,
            "Time spent reading, simplifying and sampling one layer payload."
        );
    });
}
