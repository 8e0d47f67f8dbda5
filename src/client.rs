use crate::backend::{check_status, LineStream, RunControl};
use crate::constants::*;
use crate::format::escape_display;
use crate::plan::{PlanTracker, PlanUpdate};
use crate::poller::{PollOutcome, PollStop, PollerConfig, ResumePoller};
use crate::relay::RelayFrame;
use crate::session::SessionState;
use crate::tags;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

/// HTTP client for the relay's `/api/*` surface.
#[derive(Clone)]
pub struct RelayApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl RelayApiClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(RelayError::Network)?;
        check_status(response).await
    }

    /// Posts the conversation and returns the framed response body, line by line.
    pub async fn chat(&self, request: &ChatRequest) -> Result<LineStream> {
        tracing::debug!(
            "[🖥️  -> ⚙️ ] chat [{}...] with {} messages",
            request.session_id.short(),
            request.messages.len()
        );
        let response = self.post(RELAY_CHAT_PATH, request).await?;
        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_FRAME_LINE_BYTES),
        );
        Ok(lines.boxed())
    }

    pub async fn stream_status(&self, stream_id: &SessionId) -> Result<StreamStatus> {
        let response = self
            .post(
                RELAY_STATUS_PATH,
                &StreamIdArgs {
                    stream_id: stream_id.clone(),
                },
            )
            .await?;
        Ok(response.json().await.map_err(RelayError::Network)?)
    }
}

#[async_trait]
impl RunControl for RelayApiClient {
    async fn submit_user_response(&self, stream_id: &SessionId, user_response: &str) -> Result<()> {
        self.post(
            RELAY_RESPOND_PATH,
            &UserResponseArgs {
                stream_id: stream_id.clone(),
                user_response: user_response.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn get_utterances(&self, stream_id: &SessionId) -> Result<Vec<Note>> {
        let response = self
            .post(
                RELAY_UTTERANCES_PATH,
                &StreamIdArgs {
                    stream_id: stream_id.clone(),
                },
            )
            .await?;
        Ok(response.json().await.map_err(RelayError::Network)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Placeholder shown while the relay has not produced a note yet.
    Streaming,
    Complete,
    Cancelled,
    Error,
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    fn new(role: Role, content: impl Into<String>, status: EntryStatus) -> Self {
        Self {
            role,
            content: content.into(),
            status,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub session_id: SessionId,
    pub chunks: usize,
    pub paused: bool,
    pub cancelled: bool,
}

/// One conversation: the transcript, its session state and the live plan.
pub struct ChatClient {
    api: RelayApiClient,
    session: SessionState,
    transcript: Vec<TranscriptEntry>,
    plan: PlanTracker,
    poller_config: PollerConfig,
    awaiting_reply: bool,
}

impl ChatClient {
    pub fn new(api: RelayApiClient, poller_config: PollerConfig) -> Self {
        Self {
            api,
            session: SessionState::new(),
            transcript: Vec::new(),
            plan: PlanTracker::new(),
            poller_config,
            awaiting_reply: false,
        }
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn plan(&self) -> &PlanTracker {
        &self.plan
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.current_id()
    }

    /// True while the last run stopped on the paused sentinel and wants a reply.
    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    pub fn assistant_chunks(&self) -> Vec<&str> {
        self.transcript
            .iter()
            .filter(|e| e.role == Role::Assistant && e.status == EntryStatus::Complete)
            .map(|e| e.content.as_str())
            .collect()
    }

    fn history(&self) -> Vec<ChatMessage> {
        self.transcript
            .iter()
            .filter(|e| e.status == EntryStatus::Complete)
            .map(|e| ChatMessage {
                role: e.role,
                content: e.content.clone(),
            })
            .collect()
    }

    fn push_error(&mut self, message: impl Into<String>) {
        self.remove_placeholder();
        self.transcript
            .push(TranscriptEntry::new(Role::Assistant, message, EntryStatus::Error));
    }

    fn remove_placeholder(&mut self) {
        self.transcript.retain(|e| e.status != EntryStatus::Streaming);
    }

    fn apply_frame(&mut self, frame: RelayFrame) -> bool {
        match frame {
            RelayFrame::Text(chunk) => {
                self.remove_placeholder();
                self.transcript
                    .push(TranscriptEntry::new(Role::Assistant, chunk, EntryStatus::Complete));
                true
            }
            RelayFrame::Error(message) => {
                tracing::warn!("[⚙️  -> 🖥️ ] Relay reported: {}", message);
                self.push_error(message);
                false
            }
            RelayFrame::Data(value) => {
                if let Some(status) = value.get("status").and_then(|s| s.as_str()) {
                    match self
                        .transcript
                        .iter_mut()
                        .find(|e| e.status == EntryStatus::Streaming)
                    {
                        Some(entry) => entry.content = status.to_string(),
                        None => self.transcript.push(TranscriptEntry::new(
                            Role::Assistant,
                            status,
                            EntryStatus::Streaming,
                        )),
                    }
                } else if let Some(update) = PlanUpdate::from_value(&value) {
                    self.plan.apply(update);
                }
                false
            }
        }
    }

    /// Sends a new user message and applies the relayed reply to the transcript.
    pub async fn send(&mut self, text: &str, cancel: &CancellationToken) -> Result<SendOutcome> {
        self.transcript
            .push(TranscriptEntry::new(Role::User, text, EntryStatus::Complete));
        let reply_start = self.transcript.len();
        let previous_id = self.session.current_id().cloned();
        let session_id = self.session.get_session_id_for_new_message();
        if previous_id.as_ref() != Some(&session_id) {
            self.plan.clear();
        }
        self.awaiting_reply = false;

        let request = ChatRequest {
            messages: self.history(),
            session_id: session_id.clone(),
        };

        let mut lines = match self.api.chat(&request).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::error!("[🖥️  -> ⚙️ ] Chat request failed: {}", e);
                self.push_error(format!("Connection error: {}", e));
                return Err(e);
            }
        };

        let mut outcome = SendOutcome {
            session_id,
            chunks: 0,
            paused: false,
            cancelled: false,
        };

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    for entry in self.transcript.iter_mut().filter(|e| e.status == EntryStatus::Streaming) {
                        entry.status = EntryStatus::Cancelled;
                    }
                    break;
                }
                line = lines.next() => line,
            };
            let line = match line {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    tracing::error!("[⚙️  -> 🖥️ ] Reply stream broke: {}", e);
                    self.push_error(format!("Connection error: {}", e));
                    break;
                }
            };
            let frames = match RelayFrame::decode(&line) {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::warn!("[⚙️  -> 🖥️ ] Skipping bad frame: {}", e);
                    continue;
                }
            };
            for frame in frames {
                if self.apply_frame(frame) {
                    outcome.chunks += 1;
                }
            }
        }

        self.remove_placeholder();
        if !outcome.cancelled {
            let last_assistant = self
                .transcript
                .iter()
                .skip(reply_start)
                .rev()
                .find(|e| e.role == Role::Assistant && e.status == EntryStatus::Complete);
            // Any finished run retires its id; the backend would replay it otherwise.
            if let Some(entry) = last_assistant.filter(|e| tags::is_terminal(&e.content)) {
                self.session.mark_session_as_paused();
                if tags::is_paused(&entry.content) {
                    self.awaiting_reply = true;
                    outcome.paused = true;
                }
            }
        }
        Ok(outcome)
    }

    /// Replies to a paused run and appends whatever the run says next.
    pub async fn respond(&mut self, text: &str, cancel: &CancellationToken) -> Result<PollOutcome> {
        if !self.awaiting_reply {
            return Err(RelayError::InvalidRequest("no paused run is waiting for a reply".to_string()).into());
        }
        self.transcript
            .push(TranscriptEntry::new(Role::User, text, EntryStatus::Complete));
        let session_id = self.session.get_session_id();

        let poller = ResumePoller::new(self.api.clone(), self.poller_config.clone());
        let transcript = &mut self.transcript;
        let result = poller
            .resume(&session_id, text, cancel, |message| {
                let mut chunk = escape_display(&message);
                chunk.push_str(CHUNK_SEPARATOR);
                transcript.push(TranscriptEntry::new(Role::Assistant, chunk, EntryStatus::Complete));
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("[🖥️  -> ⚙️ ] Resume of [{}...] failed: {}", session_id.short(), e);
                self.push_error(format!("Could not deliver your response: {}", e));
                return Err(e);
            }
        };

        match outcome.stop {
            PollStop::Paused => self.session.mark_session_as_paused(),
            PollStop::Completed => {
                self.awaiting_reply = false;
                self.session.mark_session_as_paused();
            }
            PollStop::Failed => {
                self.awaiting_reply = false;
                self.push_error("Lost contact with the run while waiting for more output");
            }
            _ => self.awaiting_reply = false,
        }
        Ok(outcome)
    }

    /// Status of the current run, or `None` before the first message.
    pub async fn status(&self) -> Result<Option<StreamStatus>> {
        match self.session.current_id() {
            Some(id) => self.api.stream_status(id).await.map(Some),
            None => Ok(None),
        }
    }
}
