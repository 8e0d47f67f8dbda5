//! Line-level decoding of the backend's `text/event-stream` output.
//!
//! The stream arrives already split into lines (see [`crate::backend::LineStream`]); each
//! line is one of: a `data: ` frame carrying a note, a plan update or a backend error,
//! a keep-alive (blank or `:`-prefixed), or some other SSE field we do not use.

use crate::plan::PlanUpdate;
use crate::types::{Note, RelayError};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Note(Note),
    Plan(Box<PlanUpdate>),
    KeepAlive,
    /// The backend reported a failure inside the stream.
    BackendError(String),
    Done,
    /// `event:`, `id:`, `retry:` and anything else that is not a data frame.
    Ignored,
}

#[derive(Deserialize)]
struct BackendErrorFrame {
    error: String,
}

pub fn parse_frame_line(line: &str) -> std::result::Result<FrameEvent, RelayError> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() || line.starts_with(':') {
        return Ok(FrameEvent::KeepAlive);
    }

    let Some(data) = line.strip_prefix("data:") else {
        return Ok(FrameEvent::Ignored);
    };
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data == "[DONE]" {
        return Ok(FrameEvent::Done);
    }

    let value: serde_json::Value = serde_json::from_str(data)?;

    // Error first: it is the most specific shape.
    if let Ok(err) = serde_json::from_value::<BackendErrorFrame>(value.clone()) {
        return Ok(FrameEvent::BackendError(err.error));
    }
    if let Some(update) = PlanUpdate::from_value(&value) {
        return Ok(FrameEvent::Plan(Box::new(update)));
    }
    match serde_json::from_value::<Note>(value) {
        Ok(note) => Ok(FrameEvent::Note(note)),
        Err(e) => Err(RelayError::Protocol(format!(
            "data frame is neither a note nor a plan update: {}",
            e
        ))),
    }
}
