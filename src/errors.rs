//! Error types shared across the transport.

use std::fmt::{Display, Formatter};

/// Shared transport result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of the client transport.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed event record or JSON-RPC payload.
    Parse(String),
    /// Network or HTTP failure on the stream or submission channel.
    Connection(String),
    /// No session was announced within the connection wait bound.
    SessionTimeout(String),
    /// A pending call was not answered before its deadline.
    RequestTimeout(String),
    /// A pending call was abandoned before it resolved.
    Cancelled(String),
    /// The reconnect attempt ceiling was reached.
    ExhaustedRetries(String),
    /// The transport was stopped while the operation was outstanding.
    Closed(String),
    /// The transport has not been started.
    NotStarted(String),
    /// The server answered a request with a JSON-RPC error object.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message.
        message: String,
        /// Optional structured error payload.
        data: Option<serde_json::Value>,
    },
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the error is terminal for the transport as a whole rather
    /// than for a single call.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ExhaustedRetries(_) | Self::Closed(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Parse(msg) => write!(f, "parse: {msg}"),
            Self::Connection(msg) => write!(f, "connection: {msg}"),
            Self::SessionTimeout(msg) => write!(f, "session timeout: {msg}"),
            Self::RequestTimeout(msg) => write!(f, "request timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::ExhaustedRetries(msg) => write!(f, "exhausted retries: {msg}"),
            Self::Closed(msg) => write!(f, "closed: {msg}"),
            Self::NotStarted(msg) => write!(f, "not started: {msg}"),
            Self::Rpc { code, message, .. } => write!(f, "rpc error {code}: {message}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(format!("invalid json: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
