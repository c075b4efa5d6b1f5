use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::task;

/// Settlement amounts in credits.
const SETTLEMENT_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Installs the global Prometheus recorder.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("cloudbid_settlement_amount".to_string()),
            SETTLEMENT_BUCKETS,
        )?
        .install_recorder()
}

/// Serves `/metrics` on its own listener.
pub fn spawn_metrics_exporter(handle: PrometheusHandle, addr: SocketAddr) -> task::JoinHandle<()> {
    task::spawn(async move {
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || std::future::ready(handle.render())),
        );

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%addr, error = %err, "failed to bind metrics exporter");
                return;
            }
        };
        tracing::info!(%addr, "metrics exporter listening");
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "metrics exporter stopped");
        }
    })
}
