use autometrics::prometheus_exporter;
use lazy_static::lazy_static;
use prometheus::register_histogram_vec;
use prometheus::register_int_counter_vec;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;

lazy_static! {
    pub static ref APPLIED_ENTRIES_METRIC: IntCounterVec = register_int_counter_vec!(
        "rsm_applied_entries_total",
        "Number of committed log entries applied to a state machine",
        &["group"]
    )
    .expect("metric can not be created");

    pub static ref APPLY_FAILURES_METRIC: IntCounterVec = register_int_counter_vec!(
        "rsm_apply_failures_total",
        "Number of fatal apply failures that halted a state machine",
        &["group"]
    )
    .expect("metric can not be created");

    pub static ref SNAPSHOT_OPS_METRIC: IntCounterVec = register_int_counter_vec!(
        "rsm_snapshot_ops_total",
        "Snapshot operations by kind and outcome",
        &["group", "op", "outcome"]
    )
    .expect("metric can not be created");

    pub static ref SNAPSHOT_BYTES_METRIC: HistogramVec = register_histogram_vec!(
        "rsm_snapshot_bytes",
        "Histogram of snapshot payload sizes in bytes",
        &["group", "op"],
        prometheus::exponential_buckets(1024.0, 4.0, 10).unwrap()
    )
    .expect("metric can not be created");
}

/// Initialize the autometrics prometheus exporter. Call once at host
/// startup; exposing the scrape endpoint is the host's concern.
pub fn init_metrics_exporter() {
    prometheus_exporter::init();
}

/// Render all gathered metrics in the text exposition format.
pub fn encode_metrics() -> String {
    prometheus_exporter::encode_to_string().unwrap_or_default()
}
