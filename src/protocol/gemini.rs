//! Gemini Live (`BidiGenerateContent`) wire messages.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Box<Setup>),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

/// Marker for fields that are enabled by sending an empty object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input_config: Option<RealtimeInputConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

impl SpeechConfig {
    #[must_use]
    pub fn prebuilt(voice_name: impl Into<String>) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice_name.into(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputConfig {
    pub automatic_activity_detection: AutomaticActivityDetection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomaticActivityDetection {
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionResumptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    #[must_use]
    pub fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_start: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_end: Option<Empty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// One server frame. Several top-level fields may be present at once.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub session_resumption_update: Option<SessionResumptionUpdate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

impl ServerMessage {
    /// Parse one frame; also returns a top-level key (the lowest in sort order) for diagnostics.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the frame is not a JSON object of the expected shape.
    pub fn parse(frame: &str) -> Result<(Self, Option<String>), ProtocolError> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|err| ProtocolError::new("frame is not valid JSON", Some(frame)).with_source(err))?;
        let first_key = value
            .as_object()
            .ok_or_else(|| ProtocolError::new("frame is not a JSON object", Some(frame)))?
            .keys()
            .next()
            .cloned();
        let message = serde_json::from_value(value).map_err(|err| {
            ProtocolError::new("unexpected Gemini Live frame", Some(frame)).with_source(err)
        })?;
        Ok((message, first_key))
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.setup_complete.is_none()
            && self.server_content.is_none()
            && self.tool_call.is_none()
            && self.tool_call_cancellation.is_none()
            && self.go_away.is_none()
            && self.session_resumption_update.is_none()
            && self.usage_metadata.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: bool,
    #[serde(default)]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl GoAway {
    #[must_use]
    pub fn time_left_ms(&self) -> u64 {
        self.time_left.as_deref().map_or(0, parse_duration_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionUpdate {
    #[serde(default)]
    pub new_handle: Option<String>,
    #[serde(default)]
    pub resumable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<u64>,
    #[serde(default)]
    pub response_token_count: Option<u64>,
    #[serde(default)]
    pub total_token_count: Option<u64>,
}

/// Parse a protobuf JSON duration such as `"12.5s"` into milliseconds. Unparseable input is `0`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_duration_ms(text: &str) -> u64 {
    let trimmed = text.trim();
    let seconds = trimmed.strip_suffix('s').unwrap_or(trimmed);
    match seconds.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => (value * 1000.0).round() as u64,
        _ => 0,
    }
}

/// Sample rate declared in a mime type such as `audio/pcm;rate=24000`.
#[must_use]
pub fn mime_sample_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_serializes_camel_case() {
        let setup = Setup {
            model: "models/gemini-live".into(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: Some(SpeechConfig::prebuilt("Puck")),
                ..GenerationConfig::default()
            },
            system_instruction: None,
            tools: Vec::new(),
            realtime_input_config: None,
            session_resumption: Some(SessionResumptionConfig::default()),
            input_audio_transcription: None,
            output_audio_transcription: Some(Empty {}),
        };
        let json = serde_json::to_value(ClientMessage::Setup(Box::new(setup))).unwrap();
        assert_eq!(
            json,
            json!({
                "setup": {
                    "model": "models/gemini-live",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": { "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Puck" } } }
                    },
                    "sessionResumption": {},
                    "outputAudioTranscription": {}
                }
            })
        );
    }

    #[test]
    fn realtime_input_controls() {
        let input = RealtimeInput { audio_stream_end: Some(true), ..RealtimeInput::default() };
        assert_eq!(
            serde_json::to_value(ClientMessage::RealtimeInput(input)).unwrap(),
            json!({ "realtimeInput": { "audioStreamEnd": true } })
        );
    }

    #[test]
    fn parses_combined_frame() {
        let (message, first) = ServerMessage::parse(
            r#"{"serverContent":{"modelTurn":{"parts":[{"text":"hi"},{"text":"hmm","thought":true}]},"turnComplete":true},"usageMetadata":{"totalTokenCount":12}}"#,
        )
        .unwrap();
        assert_eq!(first.as_deref(), Some("serverContent"));
        let content = message.server_content.unwrap();
        assert!(content.turn_complete);
        assert!(content.model_turn.unwrap().parts[1].thought);
        assert_eq!(message.usage_metadata.unwrap().total_token_count, Some(12));
    }

    #[test]
    fn parses_lifecycle_messages() {
        let (message, _) = ServerMessage::parse(r#"{"goAway":{"timeLeft":"12.5s"}}"#).unwrap();
        assert_eq!(message.go_away.unwrap().time_left_ms(), 12_500);
        let (message, _) =
            ServerMessage::parse(r#"{"sessionResumptionUpdate":{"newHandle":"h1","resumable":true}}"#).unwrap();
        let update = message.session_resumption_update.unwrap();
        assert_eq!(update.new_handle.as_deref(), Some("h1"));
        assert!(update.resumable);
    }

    #[test]
    fn unknown_frames_are_empty() {
        let (message, first) = ServerMessage::parse(r#"{"somethingNew":{}}"#).unwrap();
        assert!(message.is_empty());
        assert_eq!(first.as_deref(), Some("somethingNew"));
        assert!(ServerMessage::parse("nope").is_err());
    }

    #[test]
    fn durations_and_rates() {
        assert_eq!(parse_duration_ms("30s"), 30_000);
        assert_eq!(parse_duration_ms("0.25s"), 250);
        assert_eq!(parse_duration_ms("soon"), 0);
        assert_eq!(mime_sample_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(mime_sample_rate("audio/pcm"), None);
    }
}
