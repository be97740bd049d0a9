use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    /// Commit buffered input audio as a user turn.
    Commit,
    /// Stop the generation in progress.
    Interrupt,
    /// Drop buffered input audio.
    Clear,
    /// Ask the model to respond now.
    CreateResponse,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Commit => "commit",
            Self::Interrupt => "interrupt",
            Self::Clear => "clear",
            Self::CreateResponse => "create_response",
        })
    }
}

/// Client-to-server command. Fire-and-forget; nothing correlates a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSignal {
    pub kind: ControlKind,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl ControlSignal {
    #[must_use]
    pub fn new(kind: ControlKind) -> Self {
        Self {
            kind,
            parameters: Map::new(),
        }
    }

    #[must_use]
    pub fn commit() -> Self {
        Self::new(ControlKind::Commit)
    }

    #[must_use]
    pub fn interrupt() -> Self {
        Self::new(ControlKind::Interrupt)
    }

    #[must_use]
    pub fn clear() -> Self {
        Self::new(ControlKind::Clear)
    }

    #[must_use]
    pub fn create_response() -> Self {
        Self::new(ControlKind::CreateResponse)
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }
}
