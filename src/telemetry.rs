//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple daemons share a process). Metric recording still works — the
/// macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    // -- Scheduler --
    describe_counter!("xw_instance_runs_total", "Total instance run requests");
    describe_counter!(
        "xw_instance_run_failures_total",
        "Run requests that failed (after dedup)"
    );
    describe_histogram!(
        "xw_instance_start_duration_seconds",
        "Wall-clock time from run request to running/unhealthy"
    );

    // -- Request routing --
    describe_counter!("xw_requests_total", "Total inference requests processed");
    describe_histogram!(
        "xw_request_duration_seconds",
        "Time to first upstream response byte"
    );
    describe_gauge!(
        "xw_request_queue_depth",
        "Requests waiting on an instance's concurrency gate"
    );

    // -- Hooks --
    describe_histogram!(
        "xw_image_pull_duration_seconds",
        "Container image pull time"
    );
    describe_counter!("xw_hook_failures_total", "Pre-run hook failures");
}
