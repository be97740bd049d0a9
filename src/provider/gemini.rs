use super::{Decoded, Endpoint, LiveProvider, WireCodec, env_api_key};
use crate::config::LiveConfig;
use crate::control::ControlKind;
use crate::event::SessionEvent;
use crate::message::{AudioPayload, LiveMessage, UsageInfo};
use crate::protocol::gemini::{
    AutomaticActivityDetection, Blob, ClientContent, ClientMessage, Content, Empty,
    FunctionDeclaration, FunctionResponse, GenerationConfig, RealtimeInput, RealtimeInputConfig,
    ResponseModality, ServerContent, ServerMessage, SessionResumptionConfig, Setup, SpeechConfig,
    Tool, ToolCall, ToolResponse, mime_sample_rate,
};
use crate::reconstruct::{ReconstructionContext, StreamChunk, ToolCallFragment};
use crate::session::{LiveInput, LiveSession};
use crate::transport::{ConnectRequest, Connector};
use crate::{Error, ProtocolError, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Value};
use std::sync::Arc;

pub const DEFAULT_BASE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-live-001";
const API_KEY_ENV: &str = "GEMINI_API_KEY";
const PROVIDER: &str = "gemini";
const DEFAULT_OUTPUT_RATE_HZ: u32 = 24_000;

/// Google Gemini Live API.
#[derive(Debug, Clone)]
pub struct GeminiLiveProvider {
    endpoint: Endpoint,
}

impl GeminiLiveProvider {
    /// # Errors
    /// Returns [`Error::Config`] if the key or model is empty.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(api_key, model, DEFAULT_BASE_URL)?,
        })
    }

    /// # Errors
    /// Returns [`Error::Config`] if `GEMINI_API_KEY` is missing or empty.
    pub fn from_env() -> Result<Self> {
        Self::new(env_api_key(API_KEY_ENV)?, DEFAULT_MODEL)
    }

    /// # Errors
    /// Returns [`Error::Url`] if `base_url` does not parse.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        self.endpoint.set_base_url(base_url)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.endpoint.connector = connector;
        self
    }
}

#[async_trait]
impl LiveProvider for GeminiLiveProvider {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn model_name(&self) -> &str {
        self.endpoint.model()
    }

    fn supports_native_recovery(&self) -> bool {
        true
    }

    async fn connect(&self, config: LiveConfig) -> Result<LiveSession> {
        config.validate()?;
        let policy = config.reconnect.clone();
        let codec = GeminiCodec::new(self.endpoint.clone(), config);
        LiveSession::start(Box::new(codec), Arc::clone(&self.endpoint.connector), policy).await
    }
}

pub struct GeminiCodec {
    endpoint: Endpoint,
    config: LiveConfig,
    turn: ReconstructionContext,
    /// Newest resumable handle; sent in `setup` on every (re)connect.
    resumption_handle: Option<String>,
}

impl GeminiCodec {
    #[must_use]
    pub fn new(endpoint: Endpoint, config: LiveConfig) -> Self {
        let resumption_handle = config.resumption_handle.clone();
        Self {
            endpoint,
            config,
            turn: ReconstructionContext::new(),
            resumption_handle,
        }
    }

    #[must_use]
    pub fn resumption_handle(&self) -> Option<&str> {
        self.resumption_handle.as_deref()
    }

    /// The `setup` message for the current configuration and resumption handle.
    #[must_use]
    pub fn setup(&self) -> Setup {
        let config = &self.config;
        let generation = &config.generation;
        let modality = if config.transcription_only {
            ResponseModality::Text
        } else {
            ResponseModality::Audio
        };
        let model = if self.endpoint.model.starts_with("models/") {
            self.endpoint.model.clone()
        } else {
            format!("models/{}", self.endpoint.model)
        };
        let declarations: Vec<FunctionDeclaration> = config
            .tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            })
            .collect();
        let tools = if declarations.is_empty() {
            Vec::new()
        } else {
            vec![Tool { function_declarations: declarations }]
        };
        let vad = &config.vad;
        let tuned = vad.prefix_padding_ms.is_some() || vad.silence_duration_ms.is_some();
        let realtime_input_config = (!vad.enabled || tuned).then(|| RealtimeInputConfig {
            automatic_activity_detection: AutomaticActivityDetection {
                disabled: !vad.enabled,
                prefix_padding_ms: vad.prefix_padding_ms,
                silence_duration_ms: vad.silence_duration_ms,
            },
        });

        Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![modality],
                speech_config: match (&config.voice, modality) {
                    (Some(voice), ResponseModality::Audio) => Some(SpeechConfig::prebuilt(voice.clone())),
                    _ => None,
                },
                temperature: generation.temperature,
                top_p: generation.top_p,
                top_k: generation.top_k,
                max_output_tokens: generation.max_tokens,
                presence_penalty: generation.presence_penalty,
                seed: generation.seed,
            },
            system_instruction: config
                .instructions
                .as_ref()
                .map(|text| Content::text(None, text.clone())),
            tools,
            realtime_input_config,
            session_resumption: Some(SessionResumptionConfig {
                handle: self.resumption_handle.clone(),
            }),
            input_audio_transcription: config.input_transcription.as_ref().map(|_| Empty {}),
            output_audio_transcription: (modality == ResponseModality::Audio).then_some(Empty {}),
        }
    }

    fn server_content(&mut self, content: ServerContent, out: &mut Decoded) {
        if let Some(input) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            out.emit(SessionEvent::text_delta(LiveMessage::user_text(input.text), false));
        }
        if let Some(output) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            self.push(StreamChunk::Text(output.text), out);
        }
        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            if let Some(text) = part.text.filter(|text| !text.is_empty()) {
                let chunk = if part.thought {
                    StreamChunk::Thinking(text)
                } else {
                    StreamChunk::Text(text)
                };
                self.push(chunk, out);
            }
            if let Some(blob) = part.inline_data {
                match BASE64.decode(blob.data.as_bytes()) {
                    Ok(bytes) => {
                        let rate = mime_sample_rate(&blob.mime_type).unwrap_or(DEFAULT_OUTPUT_RATE_HZ);
                        out.emit(SessionEvent::audio_delta(
                            LiveMessage::audio(AudioPayload::pcm16(bytes, rate)),
                            false,
                        ));
                    }
                    Err(err) => out.fail(
                        ProtocolError::new("inline audio is not valid base64", Some(blob.data.as_str()))
                            .with_source(err),
                    ),
                }
            }
        }
        if content.interrupted {
            self.turn = ReconstructionContext::new();
            out.emit(SessionEvent::interrupted());
        }
        if content.generation_complete {
            out.emit(SessionEvent::generation_complete(self.turn.snapshot()));
        }
        if content.turn_complete {
            out.emit(SessionEvent::turn_complete(std::mem::take(&mut self.turn).finish()));
        }
    }

    fn push(&mut self, chunk: StreamChunk, out: &mut Decoded) {
        if let Some(message) = self.turn.push(chunk) {
            out.emit(SessionEvent::text_delta(message, false));
        }
    }

    fn tool_call(&mut self, call: ToolCall, out: &mut Decoded) {
        let mut calls = ReconstructionContext::new();
        for function in call.function_calls {
            // Calls arrive whole; number id-less ones across the turn so they never merge.
            let id = function
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", self.turn.tool_call_count()));
            let fragment = ToolCallFragment {
                id: Some(id),
                name: function.name,
                arguments: Some(function.args.unwrap_or_default()),
                raw: None,
            };
            self.turn.push_fragment(fragment.clone());
            calls.push_fragment(fragment);
        }
        if calls.tool_call_count() > 0 {
            out.emit(SessionEvent::tool_call(LiveMessage::assistant(calls.tool_calls()), true));
        }
    }

    fn frame(message: &ClientMessage) -> Result<Vec<String>> {
        Ok(vec![serde_json::to_string(message)?])
    }
}

impl WireCodec for GeminiCodec {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn connect_request(&self) -> Result<ConnectRequest> {
        Ok(ConnectRequest::new(self.endpoint.base_url.clone())
            .header("x-goog-api-key", self.endpoint.api_key.clone()))
    }

    fn on_open(&mut self) -> Result<Vec<String>> {
        tracing::debug!(
            provider = PROVIDER,
            resuming = self.resumption_handle.is_some(),
            "sending setup"
        );
        Self::frame(&ClientMessage::Setup(Box::new(self.setup())))
    }

    fn decode(&mut self, frame: &str) -> Decoded {
        let mut out = Decoded::default();
        let (message, first_key) = match ServerMessage::parse(frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                out.fail(err);
                return out;
            }
        };
        if message.is_empty() {
            let kind = first_key.unwrap_or_else(|| "unknown".to_string());
            out.emit(SessionEvent::unknown(kind, Some(frame)));
            return out;
        }
        if message.setup_complete.is_some() {
            out.ready = true;
        }
        if let Some(content) = message.server_content {
            self.server_content(content, &mut out);
        }
        if let Some(call) = message.tool_call {
            self.tool_call(call, &mut out);
        }
        if message.tool_call_cancellation.is_some() {
            out.emit(SessionEvent::unknown("toolCallCancellation", Some(frame)));
        }
        if let Some(update) = message.session_resumption_update {
            if update.resumable {
                if let Some(handle) = &update.new_handle {
                    self.resumption_handle = Some(handle.clone());
                }
            }
            out.emit(SessionEvent::session_resumption(
                update.new_handle.as_deref(),
                update.resumable,
            ));
        }
        if let Some(go_away) = message.go_away {
            let time_left_ms = go_away.time_left_ms();
            tracing::info!(provider = PROVIDER, time_left_ms, "server is going away");
            out.emit(SessionEvent::go_away(time_left_ms));
        }
        if let Some(usage) = message.usage_metadata {
            out.emit(SessionEvent::usage_metadata(LiveMessage::usage(UsageInfo {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.response_token_count,
                total_tokens: usage.total_token_count,
            })));
        }
        out
    }

    fn encode(&mut self, input: LiveInput) -> Result<Vec<String>> {
        let message = match input {
            LiveInput::Audio(payload) => {
                if payload.is_empty() {
                    return Ok(Vec::new());
                }
                ClientMessage::RealtimeInput(RealtimeInput {
                    audio: Some(Blob {
                        mime_type: format!("audio/pcm;rate={}", payload.sample_rate_hz),
                        data: BASE64.encode(&payload.data),
                    }),
                    ..RealtimeInput::default()
                })
            }
            LiveInput::Text(text) => ClientMessage::ClientContent(ClientContent {
                turns: vec![Content::text(Some("user"), text)],
                turn_complete: false,
            }),
            LiveInput::Control(signal) => match signal.kind {
                ControlKind::Commit => ClientMessage::RealtimeInput(RealtimeInput {
                    audio_stream_end: Some(true),
                    ..RealtimeInput::default()
                }),
                // Manual activity markers are rejected while server VAD is on.
                ControlKind::Interrupt if !self.config.vad.enabled => {
                    ClientMessage::RealtimeInput(RealtimeInput {
                        activity_start: Some(Empty {}),
                        ..RealtimeInput::default()
                    })
                }
                ControlKind::CreateResponse => ClientMessage::ClientContent(ClientContent {
                    turns: Vec::new(),
                    turn_complete: true,
                }),
                ControlKind::Interrupt | ControlKind::Clear => {
                    return Err(Error::Unsupported {
                        provider: PROVIDER,
                        what: format!("the {} control signal", signal.kind),
                    });
                }
            },
            LiveInput::ToolResult { call_id, name, output } => {
                let response = match output {
                    Value::Object(map) => Value::Object(map),
                    other => {
                        let mut wrapped = Map::new();
                        wrapped.insert("output".to_string(), other);
                        Value::Object(wrapped)
                    }
                };
                ClientMessage::ToolResponse(ToolResponse {
                    function_responses: vec![FunctionResponse { id: call_id, name, response }],
                })
            }
        };
        Self::frame(&message)
    }

    fn on_link_lost(&mut self) {
        self.turn = ReconstructionContext::new();
    }
}
