//! Provider-agnostic message content produced by live sessions.

use base64::Engine as _;
use base64::engine::general_purpose;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

pub const PCM_MIME_TYPE: &str = "audio/pcm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Raw audio with its declared format. Bytes are never transcoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPayload {
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub data: Vec<u8>,
    pub mime_type: String,
    pub sample_rate_hz: u32,
    pub bit_depth: u16,
    pub channel_count: u16,
}

impl AudioPayload {
    /// Mono 16-bit PCM at `sample_rate_hz`.
    #[must_use]
    pub fn pcm16(data: Vec<u8>, sample_rate_hz: u32) -> Self {
        Self {
            data,
            mime_type: PCM_MIME_TYPE.to_string(),
            sample_rate_hz,
            bit_depth: 16,
            channel_count: 1,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback length in milliseconds, `0` if any format field is zero.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        let frame_bytes = u64::from(self.bit_depth / 8) * u64::from(self.channel_count);
        let rate = u64::from(self.sample_rate_hz);
        if frame_bytes == 0 || rate == 0 {
            return 0;
        }
        let bytes = u64::try_from(self.data.len()).unwrap_or(u64::MAX);
        bytes.saturating_mul(1000) / frame_bytes / rate
    }
}

fn to_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&general_purpose::STANDARD.encode(data))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    general_purpose::STANDARD
        .decode(encoded)
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    Audio(AudioPayload),
    ToolUse {
        id: String,
        name: String,
        input: Map<String, Value>,
    },
    ToolResult {
        id: String,
        name: String,
        output: Value,
    },
    Usage(UsageInfo),
}

impl ContentBlock {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking {
            thinking: thinking.into(),
        }
    }

    #[must_use]
    pub const fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }
}

/// One reconstructed message, either a streamed delta or a finished turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl LiveMessage {
    #[must_use]
    pub const fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    #[must_use]
    pub const fn assistant(content: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, content)
    }

    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    #[must_use]
    pub fn audio(payload: AudioPayload) -> Self {
        Self::assistant(vec![ContentBlock::Audio(payload)])
    }

    #[must_use]
    pub fn usage(usage: UsageInfo) -> Self {
        Self::assistant(vec![ContentBlock::Usage(usage)])
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Concatenation of all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenation of all reasoning blocks.
    #[must_use]
    pub fn thinking(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Thinking { thinking } => Some(thinking.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Map<String, Value>)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_use)
    }

    #[must_use]
    pub fn audio_payload(&self) -> Option<&AudioPayload> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Audio(payload) => Some(payload),
            _ => None,
        })
    }
}
