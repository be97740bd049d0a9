//! Canonical events emitted by every live session, regardless of provider.

use crate::error::{Error, preview};
use crate::message::LiveMessage;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Metadata keys attached by the event factories.
pub mod keys {
    pub const SESSION_ENDED_REASON: &str = "live.session.ended_reason";
    pub const SESSION_RECOVERABLE: &str = "live.session.recoverable";
    pub const ERROR_TYPE: &str = "live.error.type";
    pub const ERROR_MESSAGE: &str = "live.error.message";
    pub const RESUMPTION_HANDLE: &str = "live.session.resumption_handle";
    pub const RESUMABLE: &str = "live.session.resumable";
    pub const CONNECTION_ATTEMPT: &str = "live.connection.attempt";
    pub const CONNECTION_MAX_ATTEMPTS: &str = "live.connection.max_attempts";
    pub const CONNECTION_STATE: &str = "live.connection.state";
    pub const CONNECTION_REASON: &str = "live.connection.reason";
    pub const CONNECTION_RECOVERABLE: &str = "live.connection.recoverable";
    pub const GO_AWAY_TIME_LEFT_MS: &str = "live.go_away.time_left_ms";
    pub const ORIGINAL_TYPE: &str = "live.original_type";
    pub const RAW_PREVIEW: &str = "live.raw_preview";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AudioDelta,
    TextDelta,
    SessionEnded,
    Error,
    SessionResumption,
    Reconnecting,
    Reconnected,
    TurnComplete,
    SpeechStarted,
    SpeechStopped,
    ToolCall,
    ConnectionState,
    GoAway,
    Interrupted,
    GenerationComplete,
    UsageMetadata,
    Unknown,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AudioDelta => "audio_delta",
            Self::TextDelta => "text_delta",
            Self::SessionEnded => "session_ended",
            Self::Error => "error",
            Self::SessionResumption => "session_resumption",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::TurnComplete => "turn_complete",
            Self::SpeechStarted => "speech_started",
            Self::SpeechStopped => "speech_stopped",
            Self::ToolCall => "tool_call",
            Self::ConnectionState => "connection_state",
            Self::GoAway => "go_away",
            Self::Interrupted => "interrupted",
            Self::GenerationComplete => "generation_complete",
            Self::UsageMetadata => "usage_metadata",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One thing that happened during a live session.
///
/// Every constructor assigns a fresh v4 id; equality compares ids only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    kind: EventKind,
    event_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<LiveMessage>,
    is_last: bool,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    metadata: IndexMap<String, String>,
}

impl PartialEq for SessionEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for SessionEvent {}

impl SessionEvent {
    fn new(kind: EventKind, message: Option<LiveMessage>, is_last: bool) -> Self {
        Self {
            kind,
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            message,
            is_last,
            metadata: IndexMap::new(),
        }
    }

    fn meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn audio_delta(message: LiveMessage, is_last: bool) -> Self {
        Self::new(EventKind::AudioDelta, Some(message), is_last)
    }

    #[must_use]
    pub fn text_delta(message: LiveMessage, is_last: bool) -> Self {
        Self::new(EventKind::TextDelta, Some(message), is_last)
    }

    #[must_use]
    pub fn tool_call(message: LiveMessage, is_last: bool) -> Self {
        Self::new(EventKind::ToolCall, Some(message), is_last)
    }

    /// End of a model turn. `message` is `None` when the turn produced nothing.
    #[must_use]
    pub fn turn_complete(message: Option<LiveMessage>) -> Self {
        Self::new(EventKind::TurnComplete, message, true)
    }

    #[must_use]
    pub fn generation_complete(message: Option<LiveMessage>) -> Self {
        Self::new(EventKind::GenerationComplete, message, true)
    }

    #[must_use]
    pub fn usage_metadata(message: LiveMessage) -> Self {
        Self::new(EventKind::UsageMetadata, Some(message), true)
    }

    #[must_use]
    pub fn session_ended(reason: impl Into<String>, recoverable: bool) -> Self {
        Self::new(EventKind::SessionEnded, None, true)
            .meta(keys::SESSION_ENDED_REASON, reason)
            .meta(keys::SESSION_RECOVERABLE, recoverable.to_string())
    }

    #[must_use]
    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, None, true)
            .meta(keys::ERROR_TYPE, error_type)
            .meta(keys::ERROR_MESSAGE, message)
    }

    /// An `error` event describing `err`.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    #[must_use]
    pub fn session_resumption(handle: Option<&str>, resumable: bool) -> Self {
        Self::new(EventKind::SessionResumption, None, false)
            .meta(keys::RESUMPTION_HANDLE, handle.unwrap_or_default())
            .meta(keys::RESUMABLE, resumable.to_string())
    }

    #[must_use]
    pub fn reconnecting(attempt: u32, max_attempts: u32) -> Self {
        Self::new(EventKind::Reconnecting, None, false)
            .meta(keys::CONNECTION_ATTEMPT, attempt.to_string())
            .meta(keys::CONNECTION_MAX_ATTEMPTS, max_attempts.to_string())
    }

    #[must_use]
    pub fn reconnected() -> Self {
        Self::new(EventKind::Reconnected, None, true)
    }

    #[must_use]
    pub fn connection_state(
        state: impl Into<String>,
        reason: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self::new(EventKind::ConnectionState, None, false)
            .meta(keys::CONNECTION_STATE, state)
            .meta(keys::CONNECTION_REASON, reason)
            .meta(keys::CONNECTION_RECOVERABLE, recoverable.to_string())
    }

    #[must_use]
    pub fn go_away(time_left_ms: u64) -> Self {
        Self::new(EventKind::GoAway, None, false)
            .meta(keys::GO_AWAY_TIME_LEFT_MS, time_left_ms.to_string())
    }

    #[must_use]
    pub fn speech_started() -> Self {
        Self::new(EventKind::SpeechStarted, None, true)
    }

    #[must_use]
    pub fn speech_stopped() -> Self {
        Self::new(EventKind::SpeechStopped, None, true)
    }

    #[must_use]
    pub fn interrupted() -> Self {
        Self::new(EventKind::Interrupted, None, true)
    }

    #[must_use]
    pub fn unknown(original_type: impl Into<String>, raw: Option<&str>) -> Self {
        Self::new(EventKind::Unknown, None, false)
            .meta(keys::ORIGINAL_TYPE, original_type)
            .meta(keys::RAW_PREVIEW, preview(raw))
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub const fn message(&self) -> Option<&LiveMessage> {
        self.message.as_ref()
    }

    #[must_use]
    pub fn into_message(self) -> Option<LiveMessage> {
        self.message
    }

    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.is_last
    }

    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// All metadata in insertion order.
    #[must_use]
    pub const fn metadata_map(&self) -> &IndexMap<String, String> {
        &self.metadata
    }
}
