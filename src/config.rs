use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// How the bot talks to the site: a WebDriver-driven browser or the form-POST API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Browser,
    Api,
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "browser" => Ok(Method::Browser),
            "api" => Ok(Method::Api),
            other => Err(format!("unknown method '{other}'")),
        }
    }
}

/// Immutable run configuration, loaded once from the environment and passed
/// to every stage. Credentials are required; everything else has a default.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub username: String,
    pub password: String,
    pub fund_password: String,
    /// Withdrawal amount, which doubles as the balance threshold.
    pub withdraw_amount: f64,
    pub website_url: String,
    pub api_base_url: String,
    pub whatsapp_group: String,
    pub default_identity: String,
    pub default_method: Method,
    pub webdriver_url: String,
    /// Where proof and debug screenshots land.
    pub artifact_dir: PathBuf,
    /// Consecutive no-progress cycles before the loop is abandoned.
    pub stall_threshold: u32,
    /// Consecutive no-progress watch polls before a task is abandoned.
    pub watch_stall_polls: u32,
    /// Wall-clock ceiling for watching a single task, in seconds.
    pub max_watch_secs: u64,
    /// Bounded retries for discovery/poll network errors.
    pub max_poll_retries: u32,
    /// How long to poll for withdrawal confirmation, in seconds.
    pub confirm_timeout_secs: u64,
    /// Local-time range during which the notify stage may send.
    pub send_window: (NaiveTime, NaiveTime),
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn optional(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_time(key: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

impl BotConfig {
    /// Loads configuration from the process environment, reading `.env` first
    /// if one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let withdraw_raw = optional("WITHDRAW_AMOUNT", "60");
        let withdraw_amount: f64 =
            withdraw_raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    key: "WITHDRAW_AMOUNT",
                    value: withdraw_raw.clone(),
                })?;

        let method_raw = optional("DEFAULT_METHOD", "browser");
        let default_method = method_raw.parse().map_err(|_| ConfigError::Invalid {
            key: "DEFAULT_METHOD",
            value: method_raw.clone(),
        })?;

        let window_raw = optional("SEND_WINDOW", "09:30-20:00");
        let (start_raw, end_raw) =
            window_raw
                .split_once('-')
                .ok_or_else(|| ConfigError::Invalid {
                    key: "SEND_WINDOW",
                    value: window_raw.clone(),
                })?;
        let send_window = (
            parse_time("SEND_WINDOW", start_raw.trim())?,
            parse_time("SEND_WINDOW", end_raw.trim())?,
        );

        Ok(Self {
            username: required("WEBSITE_USERNAME")?,
            password: required("WEBSITE_PASSWORD")?,
            fund_password: required("FUND_PASSWORD")?,
            withdraw_amount,
            website_url: optional("WEBSITE_URL", "https://akqaflicksph.com"),
            api_base_url: optional("API_BASE_URL", "https://api.aksystemph.com"),
            whatsapp_group: optional("WHATSAPP_GROUP", "AKQA Working Group 1368"),
            default_identity: optional("DEFAULT_IDENTITY", "Internship"),
            default_method,
            webdriver_url: optional("WEBDRIVER_URL", "http://localhost:4444"),
            artifact_dir: PathBuf::from(optional("ARTIFACT_DIR", "artifacts")),
            stall_threshold: 3,
            watch_stall_polls: 15,
            max_watch_secs: 600,
            max_poll_retries: 3,
            confirm_timeout_secs: 60,
            send_window,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("Browser".parse::<Method>().unwrap(), Method::Browser);
        assert_eq!("API".parse::<Method>().unwrap(), Method::Api);
        assert!("carrier-pigeon".parse::<Method>().is_err());
    }

    #[test]
    fn send_window_format_parses() {
        let t = parse_time("SEND_WINDOW", "09:30").unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert!(parse_time("SEND_WINDOW", "9 thirty").is_err());
    }
}
