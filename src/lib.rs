pub mod backend;
pub mod client;
pub mod constants;
pub mod format;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod plan;
pub mod poller;
pub mod relay;
pub mod server;
pub mod session;
pub mod sse;
pub mod str_utils;
pub mod tags;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
