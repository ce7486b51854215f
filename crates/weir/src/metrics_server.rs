use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the process-wide Prometheus recorder. Called once at startup;
/// the returned handle renders the exposition text for `GET /metrics`.
pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(
            &prometheus::exponential_buckets(0.0001, 2.5, 14)
                .expect("calculating histogram buckets"),
        )
        .expect("calculating histogram buckets")
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

/// A handle backed by a recorder that is never installed process-wide.
/// Lets tests build the full router without fighting over the global
/// recorder slot.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

pub async fn render(
    axum::extract::State(handle): axum::extract::State<PrometheusHandle>,
) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::OK, handle.render())
}
