//! Control-plane HTTP server.

mod prom;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, HttpResult};
use crate::models::PipelineConfig;
use crate::registry::{PipelineView, Registry};

pub use self::prom::spawn_prom_server;

/// Content types under which pipeline documents are parsed as YAML; all others are JSON.
const YAML_CONTENT_TYPES: [&str; 3] = ["application/yaml", "application/x-yaml", "text/yaml"];

/// Application server.
pub struct AppServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The registry of all pipelines.
    registry: Registry,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

#[derive(Serialize)]
struct Created {
    id: Uuid,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, registry: Registry, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, registry, shutdown }
    }

    /// Spawn the control-plane server, triggering a global shutdown if it stops.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let (shutdown, mut shutdown_rx) = (self.shutdown.clone(), self.shutdown.subscribe());
        let app = router(self.registry);
        tokio::spawn(async move {
            let listener = TcpListener::bind(addr).await.context("error binding control-plane listener")?;
            tracing::info!("control-plane server is listening at {}", addr);
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _res = shutdown_rx.recv().await;
                })
                .await
                .context("error from control-plane server");
            let _res = shutdown.send(());
            res
        })
    }
}

/// Build the control-plane router over the given registry.
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pipelines", get(list_pipelines).post(create_pipeline))
        .route("/pipelines/:id", get(get_pipeline).put(update_pipeline).delete(delete_pipeline))
        .route("/pipelines/:id/start", post(start_pipeline))
        .route("/pipelines/:id/pause", post(pause_pipeline))
        .route("/pipelines/:id/shutdown", post(shutdown_pipeline))
        .route("/pipelines/:id/restart", post(restart_pipeline))
        .with_state(registry)
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn list_pipelines(State(registry): State<Registry>) -> Json<Vec<PipelineView>> {
    Json(registry.list())
}

#[tracing::instrument(level = "debug", skip(registry, headers, body))]
async fn create_pipeline(State(registry): State<Registry>, headers: HeaderMap, body: Bytes) -> HttpResult<(StatusCode, Json<Created>)> {
    let config = parse_config(&headers, &body)?;
    let id = registry.create(config).await.map_err(AppError::http)?;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

async fn get_pipeline(State(registry): State<Registry>, Path(id): Path<String>) -> HttpResult<Json<PipelineView>> {
    let id = parse_id(&id)?;
    registry.get(&id).map(Json).map_err(AppError::http)
}

#[tracing::instrument(level = "debug", skip(registry, headers, body))]
async fn update_pipeline(State(registry): State<Registry>, Path(id): Path<String>, headers: HeaderMap, body: Bytes) -> HttpResult<Json<PipelineView>> {
    let id = parse_id(&id)?;
    let config = parse_config(&headers, &body)?;
    registry.update(&id, config).await.map(Json).map_err(AppError::http)
}

#[tracing::instrument(level = "debug", skip(registry))]
async fn delete_pipeline(State(registry): State<Registry>, Path(id): Path<String>) -> HttpResult<StatusCode> {
    let id = parse_id(&id)?;
    registry.delete(&id).await.map_err(AppError::http)?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "debug", skip(registry))]
async fn start_pipeline(State(registry): State<Registry>, Path(id): Path<String>) -> HttpResult<(StatusCode, Json<PipelineView>)> {
    let id = parse_id(&id)?;
    accepted(registry.start(&id).await)
}

#[tracing::instrument(level = "debug", skip(registry))]
async fn pause_pipeline(State(registry): State<Registry>, Path(id): Path<String>) -> HttpResult<(StatusCode, Json<PipelineView>)> {
    let id = parse_id(&id)?;
    accepted(registry.pause(&id).await)
}

#[tracing::instrument(level = "debug", skip(registry))]
async fn shutdown_pipeline(State(registry): State<Registry>, Path(id): Path<String>) -> HttpResult<(StatusCode, Json<PipelineView>)> {
    let id = parse_id(&id)?;
    accepted(registry.shutdown(&id).await)
}

#[tracing::instrument(level = "debug", skip(registry))]
async fn restart_pipeline(State(registry): State<Registry>, Path(id): Path<String>) -> HttpResult<(StatusCode, Json<PipelineView>)> {
    let id = parse_id(&id)?;
    accepted(registry.restart(&id).await)
}

fn accepted(res: Result<PipelineView>) -> HttpResult<(StatusCode, Json<PipelineView>)> {
    res.map(|view| (StatusCode::ACCEPTED, Json(view))).map_err(AppError::http)
}

/// Parse a pipeline ID from the path; malformed IDs can never match a pipeline.
fn parse_id(id: &str) -> HttpResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| AppError::ResourceNotFound)
}

/// Parse a pipeline document as JSON or YAML according to the request's content type.
fn parse_config(headers: &HeaderMap, body: &[u8]) -> HttpResult<PipelineConfig> {
    let mime = headers
        .get(CONTENT_TYPE)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.split(';').next())
        .map(|val| val.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if YAML_CONTENT_TYPES.contains(&mime.as_str()) {
        serde_yaml::from_slice(body).map_err(|err| AppError::InvalidInput(format!("invalid pipeline document: {}", err)))
    } else {
        serde_json::from_slice(body).map_err(|err| AppError::InvalidInput(format!("invalid pipeline document: {}", err)))
    }
}
