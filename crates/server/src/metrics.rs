//! Prometheus metrics.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder; idempotent.
pub fn init_metrics() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("prometheus recorder installs once")
        })
        .clone()
}

pub fn record_request(path: &'static str) {
    metrics::counter!("voxgate_requests_total", "path" => path).increment(1);
}

pub fn record_error(code: &'static str) {
    metrics::counter!("voxgate_errors_total", "code" => code).increment(1);
}

/// Render the current metrics snapshot.
pub async fn metrics_handler() -> String {
    match HANDLE.get() {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}
