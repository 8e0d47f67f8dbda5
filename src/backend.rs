use crate::constants::*;
use crate::types::*;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Newline-split body of a streaming response.
pub type LineStream = BoxStream<'static, std::result::Result<String, LinesCodecError>>;

/// Operations the resume poller needs: hand the paused run a reply, then read its notes.
#[async_trait]
pub trait RunControl: Send + Sync {
    async fn submit_user_response(&self, stream_id: &SessionId, user_response: &str)
        -> Result<()>;

    async fn get_utterances(&self, stream_id: &SessionId) -> Result<Vec<Note>>;
}

/// Typed client for the orchestrator backend.
#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl BackendClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url(path))
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(RelayError::Network)?;
        check_status(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.post(path, body).await?;
        Ok(response.json::<T>().await.map_err(RelayError::Network)?)
    }

    /// Starts a backend run for `stream_id`. The acknowledgement body is returned as-is
    /// (`null` when empty).
    pub async fn create_stream(
        &self,
        stream_id: &SessionId,
        messages: &[ChatMessage],
    ) -> Result<serde_json::Value> {
        tracing::debug!(
            "[⚙️  -> ☁️ ] create_stream [{}...] with {} messages",
            stream_id.short(),
            messages.len()
        );
        let response = self
            .post(
                CREATE_STREAM_PATH,
                &CreateStreamArgs {
                    stream_id,
                    messages,
                },
            )
            .await?;
        let text = response.text().await.map_err(RelayError::Network)?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }

    /// All notes of the run so far, in emission order.
    pub async fn get_utterances(&self, stream_id: &SessionId) -> Result<Vec<Note>> {
        self.post_json(
            GET_UTTERANCES_PATH,
            &StreamIdArgs {
                stream_id: stream_id.clone(),
            },
        )
        .await
    }

    /// Opens the push endpoint. No overall request timeout applies here; the relay
    /// enforces its own deadlines.
    pub async fn stream_utterances(&self, stream_id: &SessionId) -> Result<LineStream> {
        tracing::debug!("[⚙️  -> ☁️ ] stream_utterances [{}...]", stream_id.short());
        let response = self
            .client
            .post(self.url(STREAM_UTTERANCES_PATH))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&StreamIdArgs {
                stream_id: stream_id.clone(),
            })
            .send()
            .await
            .map_err(RelayError::Network)?;
        let response = check_status(response).await?;

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_FRAME_LINE_BYTES),
        );
        Ok(lines.boxed())
    }

    pub async fn submit_user_response(
        &self,
        stream_id: &SessionId,
        user_response: &str,
    ) -> Result<serde_json::Value> {
        tracing::info!(
            "[⚙️  -> ☁️ ] submit_user_response [{}...] ({} chars)",
            stream_id.short(),
            user_response.chars().count()
        );
        let response = self
            .post(
                SUBMIT_USER_RESPONSE_PATH,
                &UserResponseArgs {
                    stream_id: stream_id.clone(),
                    user_response: user_response.to_string(),
                },
            )
            .await?;
        Ok(response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null))
    }

    pub async fn get_stream_status(&self, stream_id: &SessionId) -> Result<StreamStatus> {
        self.post_json(
            GET_STREAM_STATUS_PATH,
            &StreamIdArgs {
                stream_id: stream_id.clone(),
            },
        )
        .await
    }

    /// Reachability check: any HTTP answer counts, only transport failures do not.
    pub async fn ping(&self) -> Result<()> {
        self.client
            .post(self.url(GET_STREAM_STATUS_PATH))
            .timeout(self.request_timeout)
            .json(&StreamIdArgs {
                stream_id: SessionId::from("readiness-check"),
            })
            .send()
            .await
            .map_err(RelayError::Network)?;
        Ok(())
    }
}

#[async_trait]
impl RunControl for BackendClient {
    async fn submit_user_response(&self, stream_id: &SessionId, user_response: &str) -> Result<()> {
        BackendClient::submit_user_response(self, stream_id, user_response).await?;
        Ok(())
    }

    async fn get_utterances(&self, stream_id: &SessionId) -> Result<Vec<Note>> {
        BackendClient::get_utterances(self, stream_id).await
    }
}

pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = match response.text().await {
        Ok(text) => text,
        Err(e) => format!("(body unreadable: {})", e),
    };
    tracing::error!(
        "[☁️  -> ⚙️ ] {} failed with status {}: {}",
        status.canonical_reason().unwrap_or("request"),
        status,
        crate::str_utils::log_snippet(&body, 200)
    );
    Err(RelayError::Backend(status, body).into())
}
