use crate::backend::BackendClient;
use crate::constants::*;
use crate::poller::PollerConfig;
use crate::relay::RelayConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Base URL of the orchestrator backend.
    #[arg(long, global = true, env = "CHATRELAY_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    pub backend_url: String,
    #[arg(long, global = true, default_value = "logs")]
    pub log_dir: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP relay in front of the backend.
    Serve(ServeArgs),
    /// Interactive terminal chat against a running relay.
    Chat(ChatArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// Timeout for the short backend calls; the note stream has its own deadlines.
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = RELAY_HARD_TIMEOUT_SECS)]
    pub hard_timeout_secs: u64,
    #[arg(long, default_value_t = RELAY_INACTIVITY_TIMEOUT_SECS)]
    pub inactivity_timeout_secs: u64,
    #[arg(long, default_value_t = RELAY_STALL_NOTICE_SECS)]
    pub stall_notice_secs: u64,
}

impl ServeArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            hard_timeout: Duration::from_secs(self.hard_timeout_secs),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            stall_notice_after: Duration::from_secs(self.stall_notice_secs),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ChatArgs {
    #[arg(long, default_value = DEFAULT_RELAY_URL)]
    pub relay_url: String,
    #[arg(long, default_value_t = POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,
    #[arg(long, default_value_t = POLL_MAX_IDLE)]
    pub max_idle_polls: u32,
    #[arg(long, default_value_t = POLL_MAX_DURATION_SECS)]
    pub max_poll_secs: u64,
}

impl ChatArgs {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_idle_polls: self.max_idle_polls,
            max_duration: Duration::from_secs(self.max_poll_secs),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub backend: BackendClient,
    pub relay_config: RelayConfig,
    pub max_body_size: usize,
}
