use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Runtime configuration, read from the environment (a `.env` file is
/// honored via dotenvy before this runs).
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub model: String,
    pub headless: bool,
    pub step_timeout: Duration,
    pub max_retries: u32,
    pub screenshot_dir: PathBuf,
    pub log_dir: PathBuf,
    pub save_logs: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_key = match std::env::var("OPENROUTER_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("OPENROUTER_API_KEY is not set; add it to the environment or a .env file"),
        };

        Ok(Self {
            api_key,
            model: std::env::var("OPENROUTER_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4-turbo".to_string()),
            headless: env_flag("HEADLESS", false)?,
            step_timeout: Duration::from_secs(env_number("STEP_TIMEOUT", 10)?),
            max_retries: env_number("MAX_RETRIES", 2)? as u32,
            screenshot_dir: std::env::var("SCREENSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./screenshots")),
            log_dir: std::env::var("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./logs")),
            save_logs: env_flag("SAVE_LOGS", true)?,
        })
    }
}

fn env_flag(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => parse_flag(&raw).with_context(|| format!("{name} must be true or false")),
        Err(_) => Ok(default),
    }
}

fn env_number(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{name} must be a non-negative integer, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("unrecognized flag value '{other}'"),
    }
}
