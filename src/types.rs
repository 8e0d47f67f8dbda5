use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// Identifies one conversation run on the backend (the backend calls it `stream_id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// 122 random bits from the OS generator, hex encoded without dashes.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One utterance emitted by the backend during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub message: String,
    #[serde(default)]
    pub artefact_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    /// Bookkeeping notes the backend keeps for itself. Counted, never shown.
    #[serde(default, skip_serializing_if = "is_false")]
    pub internal: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Note {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Data,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Data => "data",
        };
        f.write_str(s)
    }
}

/// A history entry as the chat front end sends it. Unknown fields such as
/// `parts` or `createdAt` are dropped on deserialization and never reach the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamStatus {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub current_agent: String,
    #[serde(default)]
    pub is_active: bool,
}

// --- BACKEND WIRE TYPES ---

#[derive(Debug, Serialize)]
pub struct CreateStreamArgs<'a> {
    pub stream_id: &'a SessionId,
    pub messages: &'a [ChatMessage],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamIdArgs {
    pub stream_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponseArgs {
    pub stream_id: SessionId,
    pub user_response: String,
}

// --- ERRORS ---

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend error (status {0}): {1}")]
    Backend(axum::http::StatusCode, String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::Backend(status, _) if *status == axum::http::StatusCode::NOT_FOUND)
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            RelayError::Backend(s, m) => (*s, m.clone(), "BACKEND_ERROR"),
            RelayError::InvalidRequest(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_REQUEST",
            ),
            RelayError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            RelayError::Serialization(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            RelayError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            RelayError::Protocol(m) => (
                axum::http::StatusCode::BAD_GATEWAY,
                m.clone(),
                "PROTOCOL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
                "span_trace": self.span_trace.to_string(),
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
