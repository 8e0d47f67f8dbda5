use crate::constants::*;
use crate::health;
use crate::logging::request_id_middleware;
use crate::relay::{RelayFrame, StreamRelay};
use crate::types::*;
use crate::AppState;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(RELAY_CHAT_PATH, post(chat_handler))
        .route(RELAY_STATUS_PATH, post(status_handler))
        .route(RELAY_UTTERANCES_PATH, post(utterances_handler))
        .route(RELAY_RESPOND_PATH, post(respond_handler))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(state.max_body_size))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub stream_id: Option<String>,
    #[serde(default)]
    pub user_response: Option<String>,
}

impl StreamQuery {
    fn stream_id(&self) -> Result<SessionId> {
        match self.stream_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Ok(SessionId::from(id)),
            _ => Err(RelayError::InvalidRequest("Missing stream_id".to_string()).into()),
        }
    }
}

async fn chat_handler(State(state): State<Arc<AppState>>, Json(request): Json<ChatRequest>) -> Response {
    if request.session_id.as_str().trim().is_empty() {
        return ObservedError::from(RelayError::InvalidRequest("Missing session_id".to_string()))
            .into_response();
    }
    tracing::info!(
        "[🖥️  -> ⚙️ ] Chat for [{}...] with {} messages",
        request.session_id.short(),
        request.messages.len()
    );

    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    // Parented to the request span.
    let relay_span = tracing::info_span!("relay", stream_id = %request.session_id.short());
    let backend = state.backend.clone();
    let config = state.relay_config.clone();

    tokio::spawn(
        async move {
            let outcome = StreamRelay::run(backend, request, config, tx).await;
            tracing::info!(
                "[⚙️  -> 🖥️ ] Relay finished: {} notes, {}",
                outcome.notes_relayed,
                outcome.termination.as_str()
            );
        }
        .instrument(relay_span),
    );

    let body = ReceiverStream::new(rx).map(|frame: RelayFrame| Ok::<_, Infallible>(frame.encode()));
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        [(DATA_STREAM_HEADER, DATA_STREAM_VERSION)],
        Body::from_stream(body),
    )
        .into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>, Json(query): Json<StreamQuery>) -> Response {
    let stream_id = match query.stream_id() {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state.backend.get_stream_status(&stream_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) if e.inner.is_not_found() => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Stream not found" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Status lookup for [{}...] failed: {}", stream_id.short(), e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to fetch stream status" })),
            )
                .into_response()
        }
    }
}

async fn utterances_handler(
    State(state): State<Arc<AppState>>,
    Json(query): Json<StreamQuery>,
) -> Result<Json<Vec<Note>>> {
    let stream_id = query.stream_id()?;
    let notes = state.backend.get_utterances(&stream_id).await?;
    tracing::debug!("[☁️  -> ⚙️ ] {} notes for [{}...]", notes.len(), stream_id.short());
    Ok(Json(notes))
}

async fn respond_handler(
    State(state): State<Arc<AppState>>,
    Json(query): Json<StreamQuery>,
) -> Result<Json<serde_json::Value>> {
    let stream_id = query.stream_id()?;
    let Some(user_response) = query.user_response.as_deref() else {
        return Err(RelayError::InvalidRequest("Missing user_response".to_string()).into());
    };
    let ack = state
        .backend
        .submit_user_response(&stream_id, user_response)
        .await?;
    Ok(Json(ack))
}
