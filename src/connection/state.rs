use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, watch};

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of a live session's connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
    Resuming,
    Recovered,
    Failed,
    Closed,
}

impl ConnectionState {
    pub const ALL: [Self; 7] = [
        Self::Disconnected,
        Self::Connected,
        Self::Reconnecting,
        Self::Resuming,
        Self::Recovered,
        Self::Failed,
        Self::Closed,
    ];

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    #[must_use]
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Connected | Self::Recovered)
    }

    #[must_use]
    pub const fn is_recovering(self) -> bool {
        matches!(self, Self::Reconnecting | Self::Resuming)
    }

    /// Whether `self -> next` is an accepted edge.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Self::Closed)
                | (Self::Disconnected, Self::Connected | Self::Reconnecting)
                | (Self::Connected | Self::Recovered, Self::Failed | Self::Disconnected)
                | (Self::Reconnecting, Self::Resuming | Self::Failed)
                | (Self::Resuming, Self::Recovered | Self::Failed)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Resuming => "resuming",
            Self::Recovered => "recovered",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one applied state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionEvent {
    pub previous_state: ConnectionState,
    pub current_state: ConnectionState,
    pub reason: String,
    #[serde(default)]
    pub reconnect_attempt: u32,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StateTransitionEvent {
    #[must_use]
    pub fn new(
        previous_state: ConnectionState,
        current_state: ConnectionState,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            previous_state,
            current_state,
            reason: reason.into(),
            reconnect_attempt: 0,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.reconnect_attempt = attempt;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub const fn is_recovery_event(&self) -> bool {
        matches!(
            self.current_state,
            ConnectionState::Reconnecting | ConnectionState::Resuming | ConnectionState::Recovered
        )
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.current_state, ConnectionState::Failed) || self.error.is_some()
    }
}

/// Holds the current [`ConnectionState`] and publishes every transition.
///
/// Mutation takes `&mut self`, so the owner (the session actor) is the single writer.
/// Observers read through [`subscribe`](Self::subscribe) or [`watch`](Self::watch).
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    transitions: broadcast::Sender<StateTransitionEvent>,
    current: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    #[must_use]
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let (current, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: ConnectionState::Disconnected,
            transitions,
            current,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransitionEvent> {
        self.transitions.subscribe()
    }

    pub(crate) fn transition_sender(&self) -> broadcast::Sender<StateTransitionEvent> {
        self.transitions.clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    /// Move to `to`, recording `reason`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTransition`] if the edge is not allowed.
    pub fn transition(
        &mut self,
        to: ConnectionState,
        reason: impl Into<String>,
    ) -> Result<StateTransitionEvent> {
        self.apply(StateTransitionEvent::new(self.state, to, reason))
    }

    /// Apply a prepared transition, e.g. one carrying an attempt number or error.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTransition`] if the edge is not allowed or the event
    /// does not start from the current state.
    pub fn apply(&mut self, event: StateTransitionEvent) -> Result<StateTransitionEvent> {
        if event.previous_state != self.state
            || !self.state.can_transition_to(event.current_state)
        {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: event.current_state,
            });
        }
        self.state = event.current_state;
        self.current.send_replace(self.state);
        tracing::debug!(
            from = %event.previous_state,
            to = %event.current_state,
            reason = %event.reason,
            attempt = event.reconnect_attempt,
            "connection state changed"
        );
        // No subscribers is fine.
        let _ = self.transitions.send(event.clone());
        Ok(event)
    }
}
