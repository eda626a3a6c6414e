pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "shutdown_initiated_total";
pub(crate) const METRIC_SHUTDOWN_DUPLICATE_REQUESTS: &str = "shutdown_duplicate_requests_total";
pub(crate) const METRIC_SHUTDOWN_COMPLETED: &str = "shutdown_completed_total";
pub(crate) const METRIC_SHUTDOWN_DURATION: &str = "shutdown_duration_seconds";

pub(crate) fn emit_shutdown_initiated(service_name: &str, trigger: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "service_name" => service_name.to_string(),
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_duplicate_request(service_name: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_DUPLICATE_REQUESTS,
        "service_name" => service_name.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_completed(service_name: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        METRIC_SHUTDOWN_COMPLETED,
        "service_name" => service_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!(
        METRIC_SHUTDOWN_DURATION,
        "service_name" => service_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}
