//! Typed configuration structures
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration apart from the API key.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::synthesis::{JobLimits, RetryPolicy};

/// Default Vocu API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://v1.vocu.ai";

/// Prompt (speaking style) used when a request names none.
pub const DEFAULT_PROMPT_ID: &str = "default";

/// Default cache size budget: 256 MiB.
pub const DEFAULT_QUOTA_BYTES: u64 = 256 * 1024 * 1024;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub vocu: VocuConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutsConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.retry.max_attempts == 0 {
            return Err("retry.maxAttempts must be at least 1".to_string());
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err("retry.multiplier must be at least 1.0".to_string());
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err("retry.maxBackoffMs must not be below retry.initialBackoffMs".to_string());
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("timeouts.callTimeoutSecs", t.call_timeout_secs),
            ("timeouts.connectTimeoutSecs", t.connect_timeout_secs),
            ("timeouts.pollIntervalMs", t.poll_interval_ms),
            ("timeouts.maxJobDurationSecs", t.max_job_duration_secs),
        ] {
            if value == 0 {
                return Err(format!("{name} must be greater than zero"));
            }
        }

        if url::Url::parse(&self.vocu.base_url).is_err() {
            return Err(format!("vocu.baseUrl is not a valid URL: {}", self.vocu.base_url));
        }
        if let Some(proxy) = &self.vocu.proxy {
            if url::Url::parse(proxy).is_err() {
                return Err("vocu.proxy is not a valid URL".to_string());
            }
        }

        Ok(())
    }

    /// Cache directory, falling back to the platform cache dir.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vocu-tts")
        })
    }
}

/// How synthesis requests are sent to Vocu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// Submit a job and poll it until audio is ready
    #[default]
    Async,
    /// Single blocking request that returns the audio URL
    Sync,
}

impl std::fmt::Display for RequestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async => write!(f, "async"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for RequestMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "async" => Ok(Self::Async),
            "sync" => Ok(Self::Sync),
            _ => Err(format!("Invalid request mode: {}", s)),
        }
    }
}

/// Vocu account and endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VocuConfig {
    /// API key sent as a bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub base_url: String,
    /// HTTP(S) proxy for every Vocu call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    pub request_mode: RequestMode,
    pub default_prompt_id: String,
}

impl Default for VocuConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            proxy: None,
            request_mode: RequestMode::Async,
            default_prompt_id: DEFAULT_PROMPT_ID.to_string(),
        }
    }
}

/// Retry budget for remote calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts per operation, first one included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Time bounds for remote calls and whole jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutsConfig {
    pub call_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_job_duration_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            connect_timeout_secs: 10,
            poll_interval_ms: 3000,
            max_job_duration_secs: 300,
        }
    }
}

impl TimeoutsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn job_limits(&self) -> JobLimits {
        JobLimits {
            call_timeout: self.call_timeout(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_job_duration: Duration::from_secs(self.max_job_duration_secs),
        }
    }
}

/// Local audio cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Size budget enforced by `cache prune`; 0 disables it
    pub quota_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            quota_bytes: DEFAULT_QUOTA_BYTES,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
