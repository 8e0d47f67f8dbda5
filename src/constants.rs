/// Run-termination markers embedded in note text. Matched by plain containment.
pub const COMPLETED_TAG: &str = "<taskcompleted/>";
pub const PAUSED_TAG: &str = "<taskpaused/>";

/// Appended to a paused note so the reader knows input is expected. The tag itself is kept.
pub const PAUSED_NOTICE: &str = " 🤔 <em>(Waiting for your response...)</em>";

pub const THINKING_PREFACE: &str = "Thinking...";
pub const STILL_WORKING_NOTICE: &str = "Still working on it...";

/// Trailer after every relayed note chunk.
pub const CHUNK_SEPARATOR: &str = "<br/><br/>";

/// Backend endpoints
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:4000";
pub const CREATE_STREAM_PATH: &str = "/create_stream";
pub const GET_UTTERANCES_PATH: &str = "/get_utterances";
pub const STREAM_UTTERANCES_PATH: &str = "/stream_utterances";
pub const SUBMIT_USER_RESPONSE_PATH: &str = "/submit_user_response";
pub const GET_STREAM_STATUS_PATH: &str = "/get_stream_status";

/// Relay endpoints
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8080";
pub const RELAY_CHAT_PATH: &str = "/api/chat";
pub const RELAY_STATUS_PATH: &str = "/api/status";
pub const RELAY_UTTERANCES_PATH: &str = "/api/utterances";
pub const RELAY_RESPOND_PATH: &str = "/api/respond";

/// Response header announcing the data-stream framing of `/api/chat`.
pub const DATA_STREAM_HEADER: &str = "x-vercel-ai-data-stream";
pub const DATA_STREAM_VERSION: &str = "v1";

/// Relay timing defaults
pub const RELAY_HARD_TIMEOUT_SECS: u64 = 30 * 60;
pub const RELAY_INACTIVITY_TIMEOUT_SECS: u64 = 10 * 60;
pub const RELAY_STALL_NOTICE_SECS: u64 = 2 * 60;
pub const RELAY_CHANNEL_CAPACITY: usize = 100;
pub const MAX_FRAME_LINE_BYTES: usize = 1024 * 1024;
pub const MAX_STREAM_LINES: usize = 100_000;

/// Resume poller defaults
pub const POLL_INTERVAL_MS: u64 = 1000;
pub const POLL_MAX_IDLE: u32 = 10;
pub const POLL_MAX_DURATION_SECS: u64 = 5 * 60;

/// Plan update event types carried on the note stream.
pub const PLAN_UPDATE_TYPES: &[&str] = &[
    "plan_created",
    "plan_updated",
    "asset_started",
    "asset_completed",
    "asset_failed",
    "replanning",
    "plan_completed",
    "plan_failed",
];
