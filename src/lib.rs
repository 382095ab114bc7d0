pub mod api;
pub mod client;
pub mod config;
pub mod notify;
pub mod session;
pub mod tasks;
pub mod types;
pub mod wallet;

pub use client::{BrowserClient, BrowserError, BrowserOptions};
pub use config::{BotConfig, Method};
pub use types::StageOutcome;
