use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;

/// Tracks liveness facts an operator cares about but that don't belong on
/// the signaling/media wire.
#[derive(Default)]
pub struct HealthState {
    pub pipeline_playing: AtomicBool,
    pub signaling_connected: AtomicBool,
}

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    health: Arc<HealthState>,
}

/// Serves `/healthz` and `/metrics`. No CORS or static-asset serving,
/// since there is no browser client in this agent's scope.
pub async fn run_server(config: Arc<Config>, health: Arc<HealthState>) -> anyhow::Result<()> {
    let state = AppState { config: config.clone(), health };

    let app = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = TcpListener::bind(&config.health_bind_addr).await?;
    info!(addr = %config.health_bind_addr, "health endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    pipeline_playing: bool,
    signaling_connected: bool,
}

async fn healthz_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        pipeline_playing: state.health.pipeline_playing.load(Ordering::Relaxed),
        signaling_connected: state.health.signaling_connected.load(Ordering::Relaxed),
    })
}

#[derive(Serialize)]
struct MetricsResponse {
    zsad_backend: &'static str,
    clip_enabled: bool,
    video_width: i32,
    video_height: i32,
    video_fps: i32,
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        zsad_backend: match state.config.zsad_backend {
            crate::config::ZsadBackend::Siglip => "siglip",
            crate::config::ZsadBackend::Triton => "triton",
            crate::config::ZsadBackend::None => "none",
        },
        clip_enabled: state.config.clip_enabled,
        video_width: state.config.video_width,
        video_height: state.config.video_height,
        video_fps: state.config.video_fps,
    })
}
