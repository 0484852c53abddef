//! Prometheus wiring.
//!
//! The scheduler and supervisor emit their counters, gauges, and histograms
//! inline through the `metrics` macros; all this module does is stand up
//! the exporter and give each series a description.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Stand up the global Prometheus recorder and describe every series the
/// gateway emits.
///
/// A process can only hold one recorder. When something else got there
/// first (test binaries that build several gateways), `None` comes back
/// and all subsequent macro calls keep flowing to that earlier recorder.
pub fn install() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!("modelgate_requests_total", "Completed jobs by model and status");
    describe_histogram!(
        "modelgate_queue_wait_seconds",
        "Time a job spent queued before its adapter forward began"
    );
    describe_histogram!(
        "modelgate_request_runtime_seconds",
        "Adapter forward duration per job"
    );
    describe_gauge!(
        "modelgate_queue_depth",
        "Jobs currently queued per model"
    );
    describe_counter!(
        "modelgate_provider_switches_total",
        "Provider switches (stop-before-start) by from/to pair"
    );
    describe_counter!(
        "modelgate_start_failures_total",
        "Provider start failures observed by the scheduler"
    );
}
