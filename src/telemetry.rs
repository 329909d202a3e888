//! Tracing subscriber installation and metric descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
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
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

/// Register descriptions for every metric the engine emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "depquery_query_evaluations_total",
            Unit::Count,
            "Total number of resolver invocations started by queries."
        );
        describe_counter!(
            "depquery_query_failures_total",
            Unit::Count,
            "Total number of query evaluations that settled to an error."
        );
        describe_counter!(
            "depquery_invalidations_total",
            Unit::Count,
            "Total number of keyed and global invalidations."
        );
        describe_gauge!(
            "depquery_index_keys",
            Unit::Count,
            "Current number of canonical keys with at least one subscribed query."
        );
        describe_histogram!(
            "depquery_invalidation_ms",
            Unit::Milliseconds,
            "Time for an invalidation to drain all triggered evaluations."
        );
    });
}
