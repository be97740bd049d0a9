#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Provider-neutral real-time voice sessions.
//!
//! A [`LiveProvider`] opens a [`LiveSession`]: a full-duplex link that accepts audio, text,
//! control signals and tool results, and yields a stream of canonical [`SessionEvent`]s.
//! Sessions track their own [`ConnectionState`] and reconnect according to a
//! [`ReconnectPolicy`] when the link drops.

pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod event;
pub mod message;
pub mod protocol;
pub mod provider;
pub mod reconstruct;
pub mod session;
pub mod transport;

pub use config::{GenerationParams, LiveConfig, LiveConfigBuilder, PromptTemplate, ToolDefinition, VadConfig};
pub use connection::{ConnectionState, ConnectionStateMachine, ReconnectPolicy, StateTransitionEvent};
pub use control::{ControlKind, ControlSignal};
pub use error::{Error, ProtocolError, ReconnectFailed, Result, TransportError};
pub use event::{EventKind, SessionEvent};
pub use message::{AudioPayload, ContentBlock, LiveMessage, Role, UsageInfo};
pub use provider::{DashScopeLiveProvider, GeminiLiveProvider, LiveProvider, OpenAiLiveProvider};
pub use reconstruct::{ReconstructionContext, StreamChunk, ToolCallFragment};
pub use session::{EventStream, LiveInput, LiveSession, SessionHandle};
pub use transport::{CloseInfo, ConnectRequest, Connector, Transport, WsConnector};

const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

pub(crate) fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo";
        let cut = safe_truncate(text, 2);
        assert!(cut.starts_with('h'));
        assert!(cut.contains(TRACE_TRUNCATE_SUFFIX));
        assert_eq!(safe_truncate("short", 10), "short");
    }
}
