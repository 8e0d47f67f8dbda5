use crate::backend::BackendClient;
use crate::constants::*;
use crate::format::{escape_display, format_note};
use crate::logging::RelayMetric;
use crate::sse::{parse_frame_line, FrameEvent};
use crate::tags::Sentinel;
use crate::types::*;
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::LinesCodecError;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Cap on the whole relay, whatever the backend does.
    pub hard_timeout: Duration,
    /// Cap on silence: no bytes at all, keep-alives included.
    pub inactivity_timeout: Duration,
    /// After this long without a real note, a non-terminal notice is sent.
    pub stall_notice_after: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hard_timeout: Duration::from_secs(RELAY_HARD_TIMEOUT_SECS),
            inactivity_timeout: Duration::from_secs(RELAY_INACTIVITY_TIMEOUT_SECS),
            stall_notice_after: Duration::from_secs(RELAY_STALL_NOTICE_SECS),
        }
    }
}

/// One framed chunk of the `/api/chat` response body.
///
/// Framing follows the data-stream text protocol: `0:` text parts, `2:` data parts and
/// `3:` error parts, each a JSON value on its own line.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Text(String),
    Data(serde_json::Value),
    Error(String),
}

impl RelayFrame {
    pub fn status(message: &str) -> Self {
        RelayFrame::Data(serde_json::json!({ "status": message }))
    }

    pub fn encode(&self) -> String {
        match self {
            RelayFrame::Text(text) => format!("0:{}\n", serde_json::Value::from(text.as_str())),
            RelayFrame::Data(value) => format!("2:{}\n", serde_json::Value::Array(vec![value.clone()])),
            RelayFrame::Error(msg) => format!("3:{}\n", serde_json::Value::from(msg.as_str())),
        }
    }

    /// Parses one encoded line. Data parts may hold several values; each becomes a frame.
    pub fn decode(line: &str) -> std::result::Result<Vec<RelayFrame>, RelayError> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let Some((prefix, payload)) = line.split_once(':') else {
            return Err(RelayError::Protocol(format!(
                "frame without type prefix: {}",
                crate::str_utils::log_snippet(line, 80)
            )));
        };
        match prefix {
            "0" => Ok(vec![RelayFrame::Text(serde_json::from_str(payload)?)]),
            "3" => Ok(vec![RelayFrame::Error(serde_json::from_str(payload)?)]),
            "2" => {
                let values: Vec<serde_json::Value> = serde_json::from_str(payload)?;
                Ok(values.into_iter().map(RelayFrame::Data).collect())
            }
            // Other part types (annotations, finish markers) carry nothing we render.
            _ => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed,
    Paused,
    EndOfStream,
    InactivityTimeout,
    HardTimeout,
    ClientDisconnected,
    StreamError,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::Paused => "paused",
            Termination::EndOfStream => "end_of_stream",
            Termination::InactivityTimeout => "inactivity_timeout",
            Termination::HardTimeout => "hard_timeout",
            Termination::ClientDisconnected => "client_disconnected",
            Termination::StreamError => "stream_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub notes_relayed: usize,
    pub termination: Termination,
}

/// Formats, escapes and decorates a note for forwarding.
///
/// The sentinel is looked up on the formatted text; a paused note gets the waiting
/// notice appended after the tag, which stays intact through escaping.
pub fn prepare_chunk(note: &Note) -> (String, Option<Sentinel>) {
    let mut utterance = format_note(note);
    let sentinel = Sentinel::detect(&utterance);
    if sentinel == Some(Sentinel::Paused) {
        utterance.push_str(PAUSED_NOTICE);
    }
    let mut chunk = escape_display(&utterance);
    chunk.push_str(CHUNK_SEPARATOR);
    (chunk, sentinel)
}

impl RelayOutcome {
    fn ended(termination: Termination) -> Self {
        Self {
            notes_relayed: 0,
            termination,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cut {
    Deadline,
    ClientGone,
}

/// Runs `fut` unless the deadline passes or the client goes away first.
async fn bounded<F: std::future::Future>(
    fut: F,
    deadline: Instant,
    tx: &mpsc::Sender<RelayFrame>,
) -> std::result::Result<F::Output, Cut> {
    tokio::select! {
        biased;
        _ = tx.closed() => Err(Cut::ClientGone),
        _ = sleep_until(deadline) => Err(Cut::Deadline),
        out = fut => Ok(out),
    }
}

enum Wake {
    Line(Option<std::result::Result<String, LinesCodecError>>),
    Stall,
    Inactive,
    HardTimeout,
    ClientGone,
}

pub struct StreamRelay;

impl StreamRelay {
    /// Bridges one chat request: starts the backend run, then relays its note stream
    /// into `tx` until a sentinel, end of stream, a timeout, or the client going away.
    pub async fn run(
        backend: BackendClient,
        request: ChatRequest,
        config: RelayConfig,
        tx: mpsc::Sender<RelayFrame>,
    ) -> RelayOutcome {
        let stream_id = request.session_id.clone();
        let start = Instant::now();
        let hard_deadline = start + config.hard_timeout;

        if tx.send(RelayFrame::status(THINKING_PREFACE)).await.is_err() {
            return RelayOutcome::ended(Termination::ClientDisconnected);
        }

        // Best effort: a failed create is logged and the relay carries on, so the caller
        // still sees whatever the stream says next.
        match bounded(
            backend.create_stream(&stream_id, &request.messages),
            hard_deadline,
            &tx,
        )
        .await
        {
            Ok(Ok(_)) => tracing::info!(
                "[⚙️  -> ☁️ ] Run created for [{}...] ({} messages)",
                stream_id.short(),
                request.messages.len()
            ),
            Ok(Err(e)) => tracing::error!(
                "[⚙️  -> ☁️ ] Failed to create stream [{}...]: {}",
                stream_id.short(),
                e
            ),
            Err(cut) => return Self::cut_short(cut, Termination::HardTimeout, &config, &tx).await,
        }

        // Opening the stream counts as silence: nothing may wait past either deadline.
        let open_deadline = hard_deadline.min(Instant::now() + config.inactivity_timeout);
        let opened = bounded(backend.stream_utterances(&stream_id), open_deadline, &tx).await;
        match opened {
            Ok(Ok(lines)) => Self::relay_lines_until(lines, &config, hard_deadline, &tx).await,
            Ok(Err(e)) => {
                tracing::error!("[☁️  -> ⚙️ ] Could not open note stream: {}", e);
                let _ = tx
                    .send(RelayFrame::Error(format!("Streaming error: {}", e)))
                    .await;
                RelayOutcome::ended(Termination::StreamError)
            }
            Err(cut) => {
                let timed_out = if open_deadline == hard_deadline {
                    Termination::HardTimeout
                } else {
                    Termination::InactivityTimeout
                };
                Self::cut_short(cut, timed_out, &config, &tx).await
            }
        }
    }

    async fn cut_short(
        cut: Cut,
        timed_out: Termination,
        config: &RelayConfig,
        tx: &mpsc::Sender<RelayFrame>,
    ) -> RelayOutcome {
        if cut == Cut::ClientGone {
            return RelayOutcome::ended(Termination::ClientDisconnected);
        }
        let message = if timed_out == Termination::HardTimeout {
            tracing::warn!("[☁️  -> ⚙️ ] Relay exceeded hard cap of {:?}", config.hard_timeout);
            "Streaming error: the run took too long and was cut off"
        } else {
            tracing::warn!(
                "[☁️  -> ⚙️ ] No bytes from backend for {:?}, giving up",
                config.inactivity_timeout
            );
            "Streaming error: the backend stopped responding"
        };
        let _ = tx.send(RelayFrame::Error(message.to_string())).await;
        RelayOutcome::ended(timed_out)
    }

    /// Relays from an already open stream with the hard cap counted from now.
    pub async fn relay_lines<S>(
        lines: S,
        config: &RelayConfig,
        tx: &mpsc::Sender<RelayFrame>,
    ) -> RelayOutcome
    where
        S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
    {
        Self::relay_lines_until(lines, config, Instant::now() + config.hard_timeout, tx).await
    }

    /// The reader loop. Generic over the line source so it can be driven from memory.
    pub async fn relay_lines_until<S>(
        mut lines: S,
        config: &RelayConfig,
        hard_deadline: Instant,
        tx: &mpsc::Sender<RelayFrame>,
    ) -> RelayOutcome
    where
        S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
    {
        let mut metric = RelayMetric::new();
        let mut notes_relayed = 0;

        let start = Instant::now();
        let mut inactivity_deadline = start + config.inactivity_timeout;
        let mut stall_deadline = start + config.stall_notice_after;

        let termination = loop {
            let wake = tokio::select! {
                biased;
                _ = tx.closed() => Wake::ClientGone,
                _ = sleep_until(hard_deadline) => Wake::HardTimeout,
                _ = sleep_until(inactivity_deadline) => Wake::Inactive,
                _ = sleep_until(stall_deadline) => Wake::Stall,
                line = lines.next() => Wake::Line(line),
            };

            let line = match wake {
                Wake::ClientGone => break Termination::ClientDisconnected,
                Wake::HardTimeout => {
                    tracing::warn!(
                        "[☁️  -> ⚙️ ] Relay exceeded hard cap of {:?}",
                        config.hard_timeout
                    );
                    let _ = tx
                        .send(RelayFrame::Error(
                            "Streaming error: the run took too long and was cut off".to_string(),
                        ))
                        .await;
                    break Termination::HardTimeout;
                }
                Wake::Inactive => {
                    tracing::warn!(
                        "[☁️  -> ⚙️ ] No bytes from backend for {:?}, giving up",
                        config.inactivity_timeout
                    );
                    let _ = tx
                        .send(RelayFrame::Error(
                            "Streaming error: the backend stopped responding".to_string(),
                        ))
                        .await;
                    break Termination::InactivityTimeout;
                }
                Wake::Stall => {
                    metric.stall_notices += 1;
                    tracing::debug!("[⚙️  -> 🖥️ ] Stall notice after {:?}", config.stall_notice_after);
                    if tx.send(RelayFrame::status(STILL_WORKING_NOTICE)).await.is_err() {
                        break Termination::ClientDisconnected;
                    }
                    stall_deadline = Instant::now() + config.stall_notice_after;
                    continue;
                }
                Wake::Line(None) => {
                    tracing::debug!("[☁️  -> ⚙️ ] Backend closed the note stream");
                    break Termination::EndOfStream;
                }
                Wake::Line(Some(Err(e))) => {
                    tracing::error!("[☁️  -> ⚙️ ] Stream read error: {}", e);
                    let _ = tx
                        .send(RelayFrame::Error(format!("Streaming error: {}", e)))
                        .await;
                    break Termination::StreamError;
                }
                Wake::Line(Some(Ok(line))) => line,
            };

            inactivity_deadline = Instant::now() + config.inactivity_timeout;
            metric.record_line(&line);
            if metric.lines > MAX_STREAM_LINES {
                tracing::error!("[☁️  -> ⚙️ ] Stream exceeded max line limit ({})", MAX_STREAM_LINES);
                let _ = tx
                    .send(RelayFrame::Error(
                        "Streaming error: stream exceeded line limit".to_string(),
                    ))
                    .await;
                break Termination::StreamError;
            }

            let event = match parse_frame_line(&line) {
                Ok(event) => event,
                Err(e) => {
                    metric.bad_frames += 1;
                    tracing::warn!(
                        "[☁️  -> ⚙️ ] Skipping undecodable frame ({}): {}",
                        e,
                        crate::str_utils::log_snippet(&line, 120)
                    );
                    continue;
                }
            };

            match event {
                FrameEvent::KeepAlive => {
                    metric.keep_alives += 1;
                    tracing::trace!("[☁️  -> ⚙️ ] keep-alive");
                }
                FrameEvent::Ignored => {}
                FrameEvent::Done => break Termination::EndOfStream,
                FrameEvent::BackendError(msg) => {
                    tracing::error!("[☁️  -> ⚙️ ] Backend reported: {}", msg);
                    let _ = tx
                        .send(RelayFrame::Error(format!("Streaming error: {}", msg)))
                        .await;
                    break Termination::StreamError;
                }
                FrameEvent::Plan(update) => {
                    metric.plan_updates += 1;
                    stall_deadline = Instant::now() + config.stall_notice_after;
                    let value = match serde_json::to_value(&*update) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!("Failed to re-encode plan update: {}", e);
                            continue;
                        }
                    };
                    if tx.send(RelayFrame::Data(value)).await.is_err() {
                        break Termination::ClientDisconnected;
                    }
                }
                FrameEvent::Note(note) => {
                    stall_deadline = Instant::now() + config.stall_notice_after;
                    if note.internal {
                        metric.internal_skipped += 1;
                        continue;
                    }

                    let (chunk, sentinel) = prepare_chunk(&note);
                    tracing::debug!(
                        "[⚙️  -> 🖥️ ] Relaying note from {} ({}): {}",
                        note.agent_name.as_deref().unwrap_or("-"),
                        note.model_name.as_deref().unwrap_or("-"),
                        crate::str_utils::log_snippet(&chunk, 80)
                    );
                    if tx.send(RelayFrame::Text(chunk)).await.is_err() {
                        break Termination::ClientDisconnected;
                    }
                    notes_relayed += 1;
                    metric.record_note(note.agent_name.as_deref());

                    match sentinel {
                        Some(Sentinel::Completed) => break Termination::Completed,
                        Some(Sentinel::Paused) => break Termination::Paused,
                        None => {}
                    }
                }
            }
        };

        metric.log_summary(termination.as_str());
        RelayOutcome {
            notes_relayed,
            termination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn note_line(note: &Note) -> std::result::Result<String, LinesCodecError> {
        Ok(format!("data: {}", serde_json::to_string(note).unwrap()))
    }

    fn drain(rx: &mut mpsc::Receiver<RelayFrame>) -> Vec<RelayFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn text_frames(frames: &[RelayFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                RelayFrame::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_stops_after_completed_note() {
        let mut lines = Vec::new();
        for i in 1..=7 {
            let msg = if i == 5 {
                format!("note {} <taskcompleted/>", i)
            } else {
                format!("note {}", i)
            };
            lines.push(note_line(&Note::new(msg).with_agent("orchestrator")));
            lines.push(Ok(String::new()));
        }

        let (tx, mut rx) = mpsc::channel(32);
        let outcome =
            StreamRelay::relay_lines(stream::iter(lines), &RelayConfig::default(), &tx).await;

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.notes_relayed, 5);
        let texts = text_frames(&drain(&mut rx));
        assert_eq!(texts.len(), 5);
        assert!(texts[4].contains("<taskcompleted/>"));
        assert!(texts[4].ends_with(CHUNK_SEPARATOR));
    }

    #[tokio::test]
    async fn test_paused_note_gets_notice() {
        let lines = vec![note_line(
            &Note::new("What is your \"name\"?\n<taskpaused/>").with_agent("user_input"),
        )];
        let (tx, mut rx) = mpsc::channel(8);
        let outcome =
            StreamRelay::relay_lines(stream::iter(lines), &RelayConfig::default(), &tx).await;

        assert_eq!(outcome.termination, Termination::Paused);
        let texts = text_frames(&drain(&mut rx));
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains(PAUSED_TAG));
        assert!(texts[0].contains("Waiting for your response"));
        assert!(texts[0].contains("&quot;name&quot;"));
        assert!(!texts[0].contains('\n'));
    }

    #[tokio::test]
    async fn test_bad_frame_is_skipped() {
        let lines = vec![
            Ok("data: {broken".to_string()),
            note_line(&Note::new("fine <taskcompleted/>")),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        let outcome =
            StreamRelay::relay_lines(stream::iter(lines), &RelayConfig::default(), &tx).await;
        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.notes_relayed, 1);
        assert_eq!(text_frames(&drain(&mut rx)).len(), 1);
    }

    #[tokio::test]
    async fn test_internal_notes_not_forwarded() {
        let mut hidden = Note::new("bookkeeping");
        hidden.internal = true;
        let lines = vec![note_line(&hidden), note_line(&Note::new("shown"))];
        let (tx, mut rx) = mpsc::channel(8);
        let outcome =
            StreamRelay::relay_lines(stream::iter(lines), &RelayConfig::default(), &tx).await;
        assert_eq!(outcome.termination, Termination::EndOfStream);
        assert_eq!(outcome.notes_relayed, 1);
        assert_eq!(text_frames(&drain(&mut rx)), vec!["shown<br/><br/>".to_string()]);
    }

    #[tokio::test]
    async fn test_backend_error_frame_aborts() {
        let lines = vec![
            Ok(r#"data: {"error": "Stream error: db down"}"#.to_string()),
            note_line(&Note::new("never relayed")),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        let outcome =
            StreamRelay::relay_lines(stream::iter(lines), &RelayConfig::default(), &tx).await;
        assert_eq!(outcome.termination, Termination::StreamError);
        assert_eq!(outcome.notes_relayed, 0);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            RelayFrame::Error(msg) => assert!(msg.contains("db down")),
            other => panic!("Expected error frame, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_timeout_on_silent_backend() {
        let config = RelayConfig {
            hard_timeout: Duration::from_secs(3600),
            inactivity_timeout: Duration::from_secs(600),
            stall_notice_after: Duration::from_secs(120),
        };
        let (tx, mut rx) = mpsc::channel(32);
        let lines = stream::pending::<std::result::Result<String, LinesCodecError>>();
        let outcome = StreamRelay::relay_lines(lines, &config, &tx).await;

        assert_eq!(outcome.termination, Termination::InactivityTimeout);
        let frames = drain(&mut rx);
        let notices = frames
            .iter()
            .filter(|f| **f == RelayFrame::status(STILL_WORKING_NOTICE))
            .count();
        // 120, 240, 360, 480 before the 600s cut; the one due at 600 loses to inactivity.
        assert_eq!(notices, 4);
        assert!(matches!(frames.last(), Some(RelayFrame::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alives_hold_off_inactivity_but_not_hard_cap() {
        let config = RelayConfig {
            hard_timeout: Duration::from_secs(100),
            inactivity_timeout: Duration::from_secs(30),
            stall_notice_after: Duration::from_secs(1000),
        };
        let (tx, _rx) = mpsc::channel(32);
        let keep_alives = stream::unfold((), |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Some((Ok(": keep-alive".to_string()), ()))
        });
        let outcome = StreamRelay::relay_lines(Box::pin(keep_alives), &config, &tx).await;
        assert_eq!(outcome.termination, Termination::HardTimeout);
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_relay() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let lines = stream::pending::<std::result::Result<String, LinesCodecError>>();
        let outcome = StreamRelay::relay_lines(lines, &RelayConfig::default(), &tx).await;
        assert_eq!(outcome.termination, Termination::ClientDisconnected);
    }

    #[test]
    fn test_frame_encoding() {
        assert_eq!(RelayFrame::Text("a \"b\"".to_string()).encode(), "0:\"a \\\"b\\\"\"\n");
        assert_eq!(RelayFrame::Error("x".to_string()).encode(), "3:\"x\"\n");
        assert_eq!(
            RelayFrame::status("Thinking...").encode(),
            "2:[{\"status\":\"Thinking...\"}]\n"
        );
    }

    #[test]
    fn test_frame_decoding() {
        let frames = RelayFrame::decode("0:\"hello<br/><br/>\"").unwrap();
        assert_eq!(frames, vec![RelayFrame::Text("hello<br/><br/>".to_string())]);
        let frames = RelayFrame::decode("2:[{\"status\":\"x\"},{\"status\":\"y\"}]").unwrap();
        assert_eq!(frames.len(), 2);
        assert!(RelayFrame::decode("d:{\"finishReason\":\"stop\"}").unwrap().is_empty());
        assert!(RelayFrame::decode("no prefix").is_err());
    }
}
