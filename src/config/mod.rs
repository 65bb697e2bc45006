//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! numeric vars do not parse.

use crate::error::{Error, Result};
use crate::queue::ConsumeOptions;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub queue_name: String,
    pub topic_arn: Option<String>,
    pub concurrency: usize,
    pub wait_seconds: u32,
    pub retry_seconds: u32,
    pub max_diff_ms: u64,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In production the service manager provides the vars; see
    /// [`Config::load`] for local dev.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            queue_name: required_var("QUEUE_NAME")?,
            topic_arn: std::env::var("TOPIC_ARN").ok(),
            concurrency: parsed_var("CONCURRENCY", 1)?,
            wait_seconds: parsed_var("WAIT_SECONDS", 10)?,
            retry_seconds: parsed_var("RETRY_SECONDS", 10)?,
            max_diff_ms: parsed_var("MAX_DIFF_MS", 0)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Read a `.env` file if one exists, then load from the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Polling parameters for [`crate::queue::Queue::consume`] and
    /// [`crate::queue::Queue::start_pool`].
    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            wait_seconds: self.wait_seconds,
            retry_seconds: self.retry_seconds,
            max_diff_ms: self.max_diff_ms,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
