use crate::backend::RunControl;
use crate::constants::*;
use crate::format::format_note;
use crate::tags::Sentinel;
use crate::types::*;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Consecutive polls with nothing new before giving up.
    pub max_idle_polls: u32,
    pub max_duration: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(POLL_INTERVAL_MS),
            max_idle_polls: POLL_MAX_IDLE,
            max_duration: Duration::from_secs(POLL_MAX_DURATION_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStop {
    Completed,
    Paused,
    Idle,
    TimedOut,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub notes_appended: usize,
    pub polls: u32,
    pub stop: PollStop,
}

/// Drives a paused run forward: submits the user's reply, then polls the note list and
/// hands every new note to the caller, formatted, in order.
pub struct ResumePoller<R> {
    control: R,
    config: PollerConfig,
}

impl<R: RunControl> ResumePoller<R> {
    pub fn new(control: R, config: PollerConfig) -> Self {
        Self { control, config }
    }

    pub async fn resume(
        &self,
        stream_id: &SessionId,
        user_response: &str,
        cancel: &CancellationToken,
        mut on_message: impl FnMut(String),
    ) -> Result<PollOutcome> {
        // Baseline before submitting, so notes produced right after the reply are not lost.
        let mut known = self.control.get_utterances(stream_id).await?.len();
        tracing::debug!(
            "[🖥️  -> ⚙️ ] Resuming [{}...] with {} known notes",
            stream_id.short(),
            known
        );

        self.control
            .submit_user_response(stream_id, user_response)
            .await?;

        let started = Instant::now();
        let mut outcome = PollOutcome {
            notes_appended: 0,
            polls: 0,
            stop: PollStop::Idle,
        };
        let mut idle = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.stop = PollStop::Cancelled;
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            if started.elapsed() >= self.config.max_duration {
                tracing::warn!("Resume poll for [{}...] hit its time cap", stream_id.short());
                outcome.stop = PollStop::TimedOut;
                break;
            }

            outcome.polls += 1;
            let notes = match self.control.get_utterances(stream_id).await {
                Ok(notes) => notes,
                Err(e) => {
                    tracing::error!("Resume poll for [{}...] failed: {}", stream_id.short(), e);
                    outcome.stop = PollStop::Failed;
                    break;
                }
            };

            if notes.len() <= known {
                idle += 1;
                if idle >= self.config.max_idle_polls {
                    outcome.stop = PollStop::Idle;
                    break;
                }
                continue;
            }
            idle = 0;

            let fresh = &notes[known..];
            known = notes.len();
            for note in fresh.iter().filter(|n| !n.internal) {
                if cancel.is_cancelled() {
                    break;
                }
                on_message(format_note(note));
                outcome.notes_appended += 1;
            }
            if cancel.is_cancelled() {
                outcome.stop = PollStop::Cancelled;
                break;
            }

            let newest = fresh.iter().rev().find(|n| !n.internal);
            match newest.and_then(|n| Sentinel::detect(&format_note(n))) {
                Some(Sentinel::Completed) => {
                    outcome.stop = PollStop::Completed;
                    break;
                }
                Some(Sentinel::Paused) => {
                    outcome.stop = PollStop::Paused;
                    break;
                }
                None => {}
            }
        }

        tracing::info!(
            "[🖥️  -> ⚙️ ] Resume of [{}...] ended: {:?} after {} polls, {} new notes",
            stream_id.short(),
            outcome.stop,
            outcome.polls,
            outcome.notes_appended
        );
        Ok(outcome)
    }
}
