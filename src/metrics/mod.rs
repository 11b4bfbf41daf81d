//! Prometheus collectors for storage calls, watchers and lease refreshes
//!
//! Collectors live in a crate-owned [`REGISTRY`]; embedders scrape it through
//! [`encode_metrics`].

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;

use crate::Error;

lazy_static! {
    pub static ref STORAGE_OP_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "storage_op_duration_ms",
            "Histogram of storage operation latency in ms"
        )
        .buckets(exponential_buckets(0.5, 2.0, 16).expect("buckets can be created")),
        &["op"]
    )
    .expect("metric can not be created");

    pub static ref STORAGE_OP_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("storage_op_errors", "Failed storage operations by kind"),
        &["op", "kind"]
    )
    .expect("metric can not be created");

    pub static ref ACTIVE_WATCHERS: IntGauge =
        IntGauge::new("active_watchers", "Watchers neither stopped nor closed")
            .expect("metric can not be created");

    pub static ref WATCH_OVERFLOWS: IntCounter = IntCounter::new(
        "watch_overflows",
        "Watchers closed because the consumer fell behind"
    )
    .expect("metric can not be created");

    pub static ref LEASE_REFRESHES: IntCounterVec = IntCounterVec::new(
        Opts::new("lease_refreshes", "Heartbeat refresh attempts by outcome"),
        &["result"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

pub(crate) fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(STORAGE_OP_DURATION.clone()),
        Box::new(STORAGE_OP_ERRORS.clone()),
        Box::new(ACTIVE_WATCHERS.clone()),
        Box::new(WATCH_OVERFLOWS.clone()),
        Box::new(LEASE_REFRESHES.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            warn!("collector can not be registered: {}", e);
        }
    }
}

/// Label used for an error in [`STORAGE_OP_ERRORS`]
pub(crate) fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::InitializationFailure { .. } => "initialization",
        Error::NotFound { .. } => "not_found",
        Error::BackendUnavailable { .. } => "backend_unavailable",
        Error::SubscriptionFailure { .. } => "subscription",
        Error::NotAFile { .. } | Error::NotADirectory { .. } => "conflict",
        Error::InvalidKey { .. } => "invalid_key",
        Error::Conversion(_) => "conversion",
        Error::Config(_) => "config",
    }
}

pub(crate) fn record_error(
    op: &'static str,
    err: &Error,
) {
    STORAGE_OP_ERRORS.with_label_values(&[op, error_kind(err)]).inc();
}

/// Counts the error of a finished storage call, if any, and hands the result back
pub(crate) fn observe<T>(
    op: &'static str,
    result: crate::Result<T>,
) -> crate::Result<T> {
    if let Err(e) = &result {
        record_error(op, e);
    }
    result
}

/// Export metrics in the Prometheus text format
pub fn encode_metrics() -> String {
    REGISTER.call_once(|| register_custom_metrics(&REGISTRY));

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode custom metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod metrics_test;
