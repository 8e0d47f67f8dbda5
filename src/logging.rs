use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use colored::*;
use std::panic;
use std::path::Path;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

pub const RELAY_REQUEST_ID_HEADER: &str = "x-relay-request-id";

/// Installs the global subscriber: daily-rolling file log, optional stderr output, and
/// span-trace capture for errors. Keep the returned guard alive for the process lifetime.
pub fn init_tracing(log_dir: &Path, to_stderr: bool) -> WorkerGuard {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "chatrelay=debug,tower_http=info".into(),
    };

    let _ = std::fs::create_dir_all(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "chatrelay.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = to_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(stderr_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id (reusing the caller's header when present) and runs the
/// handler inside a `request` span carrying it.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = req
        .headers()
        .get(RELAY_REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(RELAY_REQUEST_ID_HEADER, val);
    }

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(RELAY_REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-relay counters, summarised once when the relay ends.
#[derive(Default, Debug)]
pub struct RelayMetric {
    pub lines: usize,
    pub bytes: usize,
    pub keep_alives: usize,
    pub notes: usize,
    pub internal_skipped: usize,
    pub plan_updates: usize,
    pub bad_frames: usize,
    pub stall_notices: usize,
    pub agents: Vec<String>,
}

impl RelayMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_line(&mut self, line: &str) {
        self.lines += 1;
        self.bytes += line.len();
    }

    pub fn record_note(&mut self, agent: Option<&str>) {
        self.notes += 1;
        if let Some(agent) = agent {
            if !self.agents.iter().any(|a| a == agent) {
                self.agents.push(agent.to_string());
            }
        }
    }

    pub fn log_summary(&self, termination: &str) {
        let agents = if self.agents.is_empty() {
            "-".to_string()
        } else {
            self.agents.join(", ")
        };
        if self.bad_frames > 0 {
            info!(
                target: "relay_summary",
                "{}",
                format!("[RELAY] {} undecodable frame(s) skipped", self.bad_frames).yellow()
            );
        }
        info!(
            target: "relay_summary",
            "[RELAY END] {} | Notes: {} | Plan: {} | KeepAlives: {} | Lines: {} ({} bytes) | Agents: {}",
            termination,
            self.notes,
            self.plan_updates,
            self.keep_alives,
            self.lines,
            self.bytes,
            agents
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_tracks_unique_agents() {
        let mut metric = RelayMetric::new();
        metric.record_note(Some("sql"));
        metric.record_note(Some("sql"));
        metric.record_note(None);
        metric.record_note(Some("answerer"));
        assert_eq!(metric.notes, 4);
        assert_eq!(metric.agents, vec!["sql".to_string(), "answerer".to_string()]);
    }

    #[test]
    fn test_metric_counts_bytes() {
        let mut metric = RelayMetric::new();
        metric.record_line("data: {}");
        metric.record_line("");
        assert_eq!(metric.lines, 2);
        assert_eq!(metric.bytes, 8);
    }
}
