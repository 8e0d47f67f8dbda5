#![allow(dead_code)]

use axum::{
    body::Body,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chatrelay::{ChatMessage, Note};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// In-process stand-in for the orchestrator backend.
///
/// Like the real one it keeps a run's notes under its `stream_id`: creating a run with an
/// id it already knows leaves the old notes in place, and streaming replays them.
#[derive(Default)]
pub struct FakeBackend {
    /// Notes for a new run when `runs` has nothing queued.
    pub script: Vec<Note>,
    /// Per-run scripts, consumed one per newly created run.
    pub runs: Mutex<VecDeque<Vec<Note>>>,
    /// Notes that appear once a user response is submitted.
    pub after_submit: Vec<Note>,
    pub fail_create: bool,
    /// Accept `/stream_utterances` but never answer it.
    pub hang_stream: bool,
    pub created: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    pub submitted: Mutex<Vec<(String, String)>>,
    pub notes: Mutex<HashMap<String, Vec<Note>>>,
}

impl FakeBackend {
    pub fn with_script(script: Vec<Note>) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn with_runs(runs: Vec<Vec<Note>>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            ..Default::default()
        }
    }

    fn next_script(&self) -> Vec<Note> {
        self.runs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.script.clone())
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn stream_id(body: &Value) -> String {
    body.get("stream_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

async fn create_stream(State(fake): State<Arc<FakeBackend>>, Json(body): Json<Value>) -> Response {
    if fake.fail_create {
        return (StatusCode::INTERNAL_SERVER_ERROR, "create exploded").into_response();
    }
    let id = stream_id(&body);
    let messages: Vec<ChatMessage> =
        serde_json::from_value(body.get("messages").cloned().unwrap_or(json!([]))).unwrap();
    fake.created.lock().unwrap().push((id.clone(), messages));
    let mut notes = fake.notes.lock().unwrap();
    if !notes.contains_key(&id) {
        notes.insert(id.clone(), fake.next_script());
    }
    drop(notes);
    Json(json!({ "stream_id": id, "status": "started" })).into_response()
}

async fn stream_utterances(State(fake): State<Arc<FakeBackend>>, Json(body): Json<Value>) -> Response {
    if fake.hang_stream {
        std::future::pending::<()>().await;
    }
    let id = stream_id(&body);
    // A run that was never created (create failed) still streams a fresh script.
    let notes = {
        let mut all = fake.notes.lock().unwrap();
        if !all.contains_key(&id) {
            all.insert(id.clone(), fake.next_script());
        }
        all[&id].clone()
    };
    let mut payload = String::from(": connected\n\n");
    for note in &notes {
        payload.push_str(&format!("data: {}\n\n", serde_json::to_string(note).unwrap()));
        payload.push_str(": keep-alive\n\n");
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
        Body::from(payload),
    )
        .into_response()
}

async fn get_utterances(State(fake): State<Arc<FakeBackend>>, Json(body): Json<Value>) -> Response {
    let id = stream_id(&body);
    let notes = fake.notes.lock().unwrap().get(&id).cloned().unwrap_or_default();
    Json(notes).into_response()
}

async fn submit_user_response(
    State(fake): State<Arc<FakeBackend>>,
    Json(body): Json<Value>,
) -> Response {
    let id = stream_id(&body);
    let reply = body
        .get("user_response")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    fake.submitted.lock().unwrap().push((id.clone(), reply));
    fake.notes
        .lock()
        .unwrap()
        .entry(id)
        .or_default()
        .extend(fake.after_submit.iter().cloned());
    Json(json!({ "status": "ok" })).into_response()
}

async fn get_stream_status(State(fake): State<Arc<FakeBackend>>, Json(body): Json<Value>) -> Response {
    let id = stream_id(&body);
    if id == "explode" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    if !fake.notes.lock().unwrap().contains_key(&id) {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "not found" }))).into_response();
    }
    Json(json!({ "goal": "answer the question", "current_agent": "orchestrator", "is_active": true }))
        .into_response()
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Starts the fake backend and returns its base URL.
pub async fn spawn_backend(fake: Arc<FakeBackend>) -> String {
    let app = Router::new()
        .route("/create_stream", post(create_stream))
        .route("/stream_utterances", post(stream_utterances))
        .route("/get_utterances", post(get_utterances))
        .route("/submit_user_response", post(submit_user_response))
        .route("/get_stream_status", post(get_stream_status))
        .with_state(fake);
    serve(app).await
}

pub fn app_state(backend_url: &str) -> Arc<chatrelay::AppState> {
    Arc::new(chatrelay::AppState {
        backend: chatrelay::backend::BackendClient::new(
            reqwest::Client::new(),
            backend_url,
            std::time::Duration::from_secs(5),
        ),
        relay_config: chatrelay::relay::RelayConfig::default(),
        max_body_size: 1024 * 1024,
    })
}

/// Starts a relay in front of `backend_url` and returns its base URL.
pub async fn spawn_relay(backend_url: &str) -> String {
    serve(chatrelay::server::router(app_state(backend_url))).await
}
