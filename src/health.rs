use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;
use crate::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub backend: String,
    pub backend_url: String,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let backend_ok = match state.backend.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Readiness check: backend unreachable: {}", e);
            false
        }
    };

    let status_code = if backend_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if backend_ok { "ready" } else { "unready" }.to_string(),
            backend: if backend_ok { "ok" } else { "unreachable" }.to_string(),
            backend_url: state.backend.base_url().to_string(),
        }),
    )
}
