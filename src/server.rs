//! Minimal HTTP surface: liveness and capacity.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::engine::Engine;

#[derive(Clone)]
pub struct ServerState {
    pub engine: Engine,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    status: &'static str,
    capacity: usize,
    in_flight: usize,
    available: usize,
}

pub fn router(state: ServerState) -> Router {
    Router::new().route("/livez", get(livez)).with_state(state)
}

async fn livez(State(state): State<ServerState>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        capacity: state.engine.capacity(),
        in_flight: state.engine.active_count(),
        available: state.engine.available_capacity(),
    })
}

/// Serve until the shutdown flag flips.
pub async fn run(
    listener: TcpListener,
    state: ServerState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
