use super::models::{OutputItem, ResponseInfo, SessionInfo};
use crate::error::{ProtocolError, ServerError};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Messages received over an OpenAI-compatible realtime socket.
///
/// Anything unrecognised, or recognised but malformed, is kept as [`ServerEvent::Unknown`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Error {
        event_id: Option<String>,
        error: ServerError,
    },
    SessionCreated {
        event_id: Option<String>,
        session: SessionInfo,
    },
    SessionUpdated {
        event_id: Option<String>,
        session: SessionInfo,
    },
    InputAudioBufferSpeechStarted {
        item_id: Option<String>,
        audio_start_ms: Option<u32>,
    },
    InputAudioBufferSpeechStopped {
        item_id: Option<String>,
        audio_end_ms: Option<u32>,
    },
    InputAudioBufferCommitted {
        item_id: Option<String>,
    },
    InputAudioTranscriptionCompleted {
        item_id: Option<String>,
        transcript: String,
    },
    ResponseCreated {
        response: ResponseInfo,
    },
    ResponseDone {
        response: ResponseInfo,
    },
    ResponseOutputItemAdded {
        response_id: Option<String>,
        item: OutputItem,
    },
    ResponseTextDelta {
        response_id: Option<String>,
        delta: String,
    },
    ResponseAudioDelta {
        response_id: Option<String>,
        delta: String,
    },
    ResponseAudioDone {
        response_id: Option<String>,
    },
    ResponseAudioTranscriptDelta {
        response_id: Option<String>,
        delta: String,
    },
    ResponseFunctionCallArgumentsDelta {
        call_id: Option<String>,
        item_id: Option<String>,
        delta: String,
    },
    ResponseFunctionCallArgumentsDone {
        call_id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Unknown(Value),
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ServerEventRepr {
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        event_id: Option<String>,
        error: ServerError,
    },
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        event_id: Option<String>,
        #[serde(default)]
        session: SessionInfo,
    },
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        event_id: Option<String>,
        #[serde(default)]
        session: SessionInfo,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    InputAudioBufferSpeechStarted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        audio_start_ms: Option<u32>,
    },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    InputAudioBufferSpeechStopped {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        audio_end_ms: Option<u32>,
    },
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(
        rename = "conversation.item.input_audio_transcription.completed",
        alias = "input_audio_transcription.completed"
    )]
    InputAudioTranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },
    #[serde(rename = "response.output_item.added")]
    ResponseOutputItemAdded {
        #[serde(default)]
        response_id: Option<String>,
        item: OutputItem,
    },
    #[serde(rename = "response.text.delta", alias = "response.output_text.delta")]
    ResponseTextDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    ResponseAudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio.done", alias = "response.output_audio.done")]
    ResponseAudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(
        rename = "response.audio_transcript.delta",
        alias = "response.output_audio_transcript.delta"
    )]
    ResponseAudioTranscriptDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    ResponseFunctionCallArgumentsDelta {
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    ResponseFunctionCallArgumentsDone {
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
}

impl From<ServerEventRepr> for ServerEvent {
    fn from(repr: ServerEventRepr) -> Self {
        match repr {
            ServerEventRepr::Error { event_id, error } => Self::Error { event_id, error },
            ServerEventRepr::SessionCreated { event_id, session } => Self::SessionCreated { event_id, session },
            ServerEventRepr::SessionUpdated { event_id, session } => Self::SessionUpdated { event_id, session },
            ServerEventRepr::InputAudioBufferSpeechStarted { item_id, audio_start_ms } => Self::InputAudioBufferSpeechStarted { item_id, audio_start_ms },
            ServerEventRepr::InputAudioBufferSpeechStopped { item_id, audio_end_ms } => Self::InputAudioBufferSpeechStopped { item_id, audio_end_ms },
            ServerEventRepr::InputAudioBufferCommitted { item_id } => Self::InputAudioBufferCommitted { item_id },
            ServerEventRepr::InputAudioTranscriptionCompleted { item_id, transcript } => Self::InputAudioTranscriptionCompleted { item_id, transcript },
            ServerEventRepr::ResponseCreated { response } => Self::ResponseCreated { response },
            ServerEventRepr::ResponseDone { response } => Self::ResponseDone { response },
            ServerEventRepr::ResponseOutputItemAdded { response_id, item } => Self::ResponseOutputItemAdded { response_id, item },
            ServerEventRepr::ResponseTextDelta { response_id, delta } => Self::ResponseTextDelta { response_id, delta },
            ServerEventRepr::ResponseAudioDelta { response_id, delta } => Self::ResponseAudioDelta { response_id, delta },
            ServerEventRepr::ResponseAudioDone { response_id } => Self::ResponseAudioDone { response_id },
            ServerEventRepr::ResponseAudioTranscriptDelta { response_id, delta } => Self::ResponseAudioTranscriptDelta { response_id, delta },
            ServerEventRepr::ResponseFunctionCallArgumentsDelta { call_id, item_id, delta } => Self::ResponseFunctionCallArgumentsDelta { call_id, item_id, delta },
            ServerEventRepr::ResponseFunctionCallArgumentsDone { call_id, name, arguments } => Self::ResponseFunctionCallArgumentsDone { call_id, name, arguments },
        }
    }
}

impl<'de> Deserialize<'de> for ServerEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match ServerEventRepr::deserialize(value.clone()) {
            Ok(repr) => Ok(repr.into()),
            Err(err) => {
                tracing::debug!("Failed to parse ServerEvent: {err}");
                Ok(Self::Unknown(value))
            }
        }
    }
}

impl ServerEvent {
    /// Parse one text frame.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the frame is not a JSON object.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|err| ProtocolError::new("frame is not valid JSON", Some(frame)).with_source(err))?;
        if !value.is_object() {
            return Err(ProtocolError::new("frame is not a JSON object", Some(frame)));
        }
        // Deserializing from an owned Value cannot fail: unknown shapes fall back to `Unknown`.
        Ok(Self::deserialize(value).unwrap_or_else(|_| Self::Unknown(Value::Null)))
    }

    /// The wire `type`, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Error { .. } => "error",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::InputAudioBufferSpeechStarted { .. } => "input_audio_buffer.speech_started",
            Self::InputAudioBufferSpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            Self::InputAudioBufferCommitted { .. } => "input_audio_buffer.committed",
            Self::InputAudioTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::ResponseCreated { .. } => "response.created",
            Self::ResponseDone { .. } => "response.done",
            Self::ResponseOutputItemAdded { .. } => "response.output_item.added",
            Self::ResponseTextDelta { .. } => "response.text.delta",
            Self::ResponseAudioDelta { .. } => "response.audio.delta",
            Self::ResponseAudioDone { .. } => "response.audio.done",
            Self::ResponseAudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::ResponseFunctionCallArgumentsDelta { .. } => "response.function_call_arguments.delta",
            Self::ResponseFunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            Self::Unknown(value) => value.get("type").and_then(Value::as_str).unwrap_or("unknown"),
        }
    }
}
