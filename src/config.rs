//! Transport configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::{AppError, Result};

fn default_sse_path() -> String {
    "/sse".into()
}

fn default_message_path() -> String {
    "/message".into()
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_reconnect_cap_ms() -> u64 {
    30_000
}

fn default_connection_wait_seconds() -> u64 {
    10
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_submit_timeout_ms() -> u64 {
    10_000
}

fn default_notification_buffer() -> usize {
    64
}

/// Connection settings for one MCP server reached over HTTP/SSE.
///
/// Usually parsed from a TOML file:
///
/// ```toml
/// base_url = "http://127.0.0.1:3000"
/// sse_path = "/sse"
/// message_path = "/message"
/// reconnect_delay_ms = 1000
/// max_retries = 10
///
/// [headers]
/// x-client = "demo"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// Scheme, host and port of the server (e.g. `http://127.0.0.1:3000`).
    pub base_url: String,
    /// Path of the event stream endpoint.
    #[serde(default = "default_sse_path")]
    pub sse_path: String,
    /// Path of the message submission endpoint.
    #[serde(default = "default_message_path")]
    pub message_path: String,
    /// Extra headers sent with every stream and submission request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on the reconnect delay.
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    /// Maximum consecutive reconnect attempts; absent means unbounded.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// How long `send` waits for a session before giving up.
    #[serde(default = "default_connection_wait_seconds")]
    pub connection_wait_seconds: u64,
    /// Per-request correlation timeout.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// TCP/TLS connect timeout for both channels.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whole-request timeout for a single submission POST.
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// Treat a stream silent for this long as lost; absent disables the check.
    #[serde(default)]
    pub idle_timeout_seconds: Option<u64>,
    /// Capacity of the notification channel handed to the caller.
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

impl TransportConfig {
    /// Build a configuration with defaults for everything except `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `base_url` is not a valid http(s) URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let mut config = Self {
            base_url: base_url.into(),
            sse_path: default_sse_path(),
            message_path: default_message_path(),
            headers: HashMap::new(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            max_retries: None,
            connection_wait_seconds: default_connection_wait_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
            connect_timeout_ms: default_connect_timeout_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            idle_timeout_seconds: None,
            notification_buffer: default_notification_buffer(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute URL of the event stream endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the joined URL is invalid.
    pub fn sse_url(&self) -> Result<Url> {
        join_url(&self.base_url, &self.sse_path)
    }

    /// Absolute URL of the submission endpoint, without session routing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the joined URL is invalid.
    pub fn message_url(&self) -> Result<Url> {
        join_url(&self.base_url, &self.message_path)
    }

    /// Base reconnect delay.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Reconnect delay ceiling.
    #[must_use]
    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    /// Bound on how long `send` waits for a session.
    #[must_use]
    pub fn connection_wait(&self) -> Duration {
        Duration::from_secs(self.connection_wait_seconds)
    }

    /// Per-request correlation timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Connect timeout for both channels.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Whole-request timeout for one submission POST.
    #[must_use]
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// Idle stream timeout, if enabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_seconds.map(Duration::from_secs)
    }

    fn validate(&mut self) -> Result<()> {
        let base = Url::parse(&self.base_url)
            .map_err(|err| AppError::Config(format!("base_url invalid: {err}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(AppError::Config(format!(
                "base_url must use http or https, got {}",
                base.scheme()
            )));
        }

        if self.reconnect_delay_ms == 0 {
            return Err(AppError::Config(
                "reconnect_delay_ms must be greater than zero".into(),
            ));
        }

        if self.reconnect_cap_ms < self.reconnect_delay_ms {
            return Err(AppError::Config(
                "reconnect_cap_ms must not be smaller than reconnect_delay_ms".into(),
            ));
        }

        if self.notification_buffer == 0 {
            return Err(AppError::Config(
                "notification_buffer must be greater than zero".into(),
            ));
        }

        // Paths are joined onto the base; keep exactly one separating slash.
        for path in [&mut self.sse_path, &mut self.message_path] {
            if !path.starts_with('/') {
                path.insert(0, '/');
            }
        }
        self.base_url = self.base_url.trim_end_matches('/').to_owned();

        Ok(())
    }
}

fn join_url(base: &str, path: &str) -> Result<Url> {
    Url::parse(&format!("{base}{path}"))
        .map_err(|err| AppError::Config(format!("invalid endpoint url {base}{path}: {err}")))
}
