use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::registry::Registry;

#[derive(Clone)]
struct PromState {
    handle: PrometheusHandle,
    registry: Registry,
}

/// Spawns a prometheus server which renders the given recorder handle.
pub fn spawn_prom_server(config: &Config, handle: PrometheusHandle, registry: Registry, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let app = Router::new()
        .route("/metrics", get(prometheus_scrape))
        .with_state(PromState { handle, registry });
    tokio::spawn(async move {
        let listener = TcpListener::bind(addr).await.context("error binding metrics listener")?;
        tracing::info!("metrics server is listening at {}/metrics", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _res = shutdown.recv().await;
            })
            .await
            .context("error from metrics server")
    })
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(State(state): State<PromState>) -> (StatusCode, HeaderMap, String) {
    state.registry.refresh_metrics();
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.handle.render())
}
