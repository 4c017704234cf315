use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all sync metrics
const PREFIX: &str = "ci_sync";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref SYNC_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_runs_total"), "Sync runs by outcome"),
        &["outcome"]
    ).expect("Failed to create runs_total metric");

    pub static ref RECORDS_INSERTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            format!("{PREFIX}_records_inserted_total"),
            "Rows written to the analytics store"
        ),
        &["shard"]
    ).expect("Failed to create records_inserted_total metric");

    pub static ref EVENTS_ACKNOWLEDGED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_events_acknowledged_total"),
        "Change events marked as processed"
    ).expect("Failed to create events_acknowledged_total metric");

    pub static ref FLUSHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_flushes_total"), "Batch flushes by result"),
        &["result"]
    ).expect("Failed to create flushes_total metric");

    pub static ref FLUSH_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_flush_duration_seconds"),
            "Time spent writing one batch to the analytics store"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0])
    ).expect("Failed to create flush_duration_seconds metric");

    pub static ref MISSING_SOURCES_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_missing_sources_total"),
        "Events whose build no longer exists"
    ).expect("Failed to create missing_sources_total metric");

    pub static ref LEASE_CONTENTION_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_lease_contention_total"),
        "Runs skipped because another worker held the shard lease"
    ).expect("Failed to create lease_contention_total metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(SYNC_RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RECORDS_INSERTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(EVENTS_ACKNOWLEDGED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FLUSHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FLUSH_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(MISSING_SOURCES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(LEASE_CONTENTION_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_run(outcome: &str) {
    SYNC_RUNS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_flush(rows: usize, shard_id: u32, duration: Duration, success: bool) {
    let result = if success { "success" } else { "failure" };
    FLUSHES_TOTAL.with_label_values(&[result]).inc();
    FLUSH_DURATION_SECONDS.observe(duration.as_secs_f64());
    if success {
        RECORDS_INSERTED_TOTAL
            .with_label_values(&[&shard_id.to_string()])
            .inc_by(rows as u64);
    }
}

pub fn record_events_acknowledged(count: usize) {
    EVENTS_ACKNOWLEDGED_TOTAL.inc_by(count as u64);
}

pub fn record_missing_sources(count: usize) {
    MISSING_SOURCES_TOTAL.inc_by(count as u64);
}

pub fn record_lease_contention() {
    LEASE_CONTENTION_TOTAL.inc();
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}
