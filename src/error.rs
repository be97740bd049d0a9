use crate::connection::ConnectionState;
use crate::transport::CloseInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;

/// Maximum number of characters kept when previewing raw payloads.
pub const PREVIEW_MAX_CHARS: usize = 200;
const PREVIEW_SUFFIX: &str = "...";
const EMPTY_PREVIEW: &str = "<empty>";

/// Render a raw payload for diagnostics.
///
/// Payloads longer than [`PREVIEW_MAX_CHARS`] are cut and suffixed with `...`;
/// empty or absent payloads render as `<empty>`.
#[must_use]
pub fn preview(raw: Option<&str>) -> String {
    match raw {
        None | Some("") => EMPTY_PREVIEW.to_string(),
        Some(text) => match text.char_indices().nth(PREVIEW_MAX_CHARS) {
            Some((cut, _)) => format!("{}{PREVIEW_SUFFIX}", &text[..cut]),
            None => text.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    InvalidRequestError,
    RateLimitError,
    AuthenticationError,
    ServerError,
    #[serde(other)]
    Unknown,
}

impl ApiErrorType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequestError => "invalid_request_error",
            Self::RateLimitError => "rate_limit_error",
            Self::AuthenticationError => "authentication_error",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        }
    }
}

/// Error payload carried by a vendor `error` frame.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(rename = "type", default = "unknown_error_type")]
    pub error_type: ApiErrorType,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
}

const fn unknown_error_type() -> ApiErrorType {
    ApiErrorType::Unknown
}

/// An inbound payload that could not be understood.
#[derive(Debug, Error)]
#[error("{message} (raw: {preview})")]
pub struct ProtocolError {
    message: String,
    preview: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProtocolError {
    #[must_use]
    pub fn new(message: impl Into<String>, raw: Option<&str>) -> Self {
        Self {
            message: message.into(),
            preview: preview(raw),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn preview(&self) -> &str {
        &self.preview
    }
}

/// Recovery gave up after the configured number of attempts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("reconnect failed after {attempt_count} of {max_attempts} attempts{}", last_error_suffix(.last_error.as_deref()))]
pub struct ReconnectFailed {
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

fn last_error_suffix(last: Option<&str>) -> String {
    last.map(|err| format!(": {err}")).unwrap_or_default()
}

impl ReconnectFailed {
    #[must_use]
    pub const fn new(attempt_count: u32, max_attempts: u32) -> Self {
        Self {
            attempt_count,
            max_attempts,
            last_error: None,
        }
    }

    #[must_use]
    pub fn with_last_error(mut self, err: impl ToString) -> Self {
        self.last_error = Some(err.to_string());
        self
    }

    #[must_use]
    pub const fn is_max_attempts_reached(&self) -> bool {
        self.attempt_count >= self.max_attempts && self.max_attempts > 0
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Header error: {0}")]
    Header(#[from] InvalidHeaderValue),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Cannot send while connection is {0}")]
    NotSendable(ConnectionState),

    #[error("Inbound stream was already taken")]
    AlreadyReceiving,

    #[error("Connection closed ({}: {})", .0.code, .0.reason)]
    Closed(CloseInfo),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{provider} reported an error: {} ({})", .error.message, .error.error_type.as_str())]
    Api {
        provider: &'static str,
        error: ServerError,
    },

    #[error(transparent)]
    ReconnectFailed(#[from] ReconnectFailed),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("{provider} does not support {what}")]
    Unsupported {
        provider: &'static str,
        what: String,
    },

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("The session was closed")]
    SessionClosed,
}

impl Error {
    /// Short machine-readable category used for `error` events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Api { .. } => "api",
            Self::ReconnectFailed(_) => "reconnect_failed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Unsupported { .. } => "unsupported",
            Self::Serialization(_) => "serialization",
            Self::Url(_) => "url",
            Self::SessionClosed => "session_closed",
        }
    }

    /// Whether the event stream ends after this error.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ReconnectFailed(_) | Self::SessionClosed)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(TransportError::WebSocket(err))
    }
}

impl From<InvalidHeaderValue> for Error {
    fn from(err: InvalidHeaderValue) -> Self {
        Self::Transport(TransportError::Header(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
