use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// Build an axum::Router which serves the Prometheus metrics endpoint.
// Installs the process-wide metrics recorder, so build it exactly once.
pub fn build_router() -> axum::Router<()> {
    use axum::routing::get;

    let prom = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder");

    axum::Router::new()
        .route("/metrics", get(prometheus_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(prom)
}

#[tracing::instrument(skip_all)]
async fn prometheus_metrics(
    axum::extract::State(prom_handle): axum::extract::State<PrometheusHandle>,
) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::OK, prom_handle.render())
}
