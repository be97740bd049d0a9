//! Codec for OpenAI-compatible realtime sockets (`OpenAI`, `DashScope`).

use super::{Decoded, Endpoint, WireCodec};
use crate::config::LiveConfig;
use crate::control::{ControlKind, ControlSignal};
use crate::error::ProtocolError;
use crate::event::SessionEvent;
use crate::message::{AudioPayload, LiveMessage, UsageInfo};
use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::{
    ContentPart, FunctionTool, InputAudioTranscription, Item, Nullable, PromptRef, ResponseInfo,
    SessionUpdate, TurnDetection,
};
use crate::protocol::server_events::ServerEvent;
use crate::reconstruct::{ReconstructionContext, StreamChunk, ToolCallFragment};
use crate::session::LiveInput;
use crate::transport::ConnectRequest;
use crate::Result;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;
use std::collections::HashSet;

/// Both dialects stream 16-bit mono PCM at 24 kHz.
pub const OUTPUT_SAMPLE_RATE_HZ: u32 = 24_000;

/// Lifecycle frames with nothing to surface.
const QUIET_TYPES: &[&str] = &[
    "conversation.created",
    "conversation.item.created",
    "conversation.item.added",
    "conversation.item.done",
    "input_audio_buffer.cleared",
    "rate_limits.updated",
    "response.output_item.done",
    "response.content_part.added",
    "response.content_part.done",
    "response.text.done",
    "response.output_text.done",
    "response.audio_transcript.done",
    "response.output_audio_transcript.done",
    "output_audio_buffer.started",
    "output_audio_buffer.stopped",
    "output_audio_buffer.cleared",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    DashScope,
}

impl Dialect {
    #[must_use]
    pub const fn provider_name(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::DashScope => "dashscope",
        }
    }

    const fn output_audio_format(self) -> &'static str {
        match self {
            Self::OpenAi => "pcm16",
            Self::DashScope => "pcm24",
        }
    }
}

pub struct RealtimeCodec {
    dialect: Dialect,
    endpoint: Endpoint,
    config: LiveConfig,
    turn: ReconstructionContext,
    /// Calls whose arguments arrived as deltas; their `done` payload is a repeat.
    streamed_calls: HashSet<String>,
    active_response: Option<String>,
}

impl RealtimeCodec {
    #[must_use]
    pub fn new(dialect: Dialect, endpoint: Endpoint, config: LiveConfig) -> Self {
        Self {
            dialect,
            endpoint,
            config,
            turn: ReconstructionContext::new(),
            streamed_calls: HashSet::new(),
            active_response: None,
        }
    }

    /// The `session.update` body derived from the live configuration.
    #[must_use]
    pub fn session_update(&self) -> SessionUpdate {
        let config = &self.config;
        let generation = &config.generation;
        let modalities = if config.transcription_only {
            vec!["text".to_string()]
        } else {
            vec!["text".to_string(), "audio".to_string()]
        };
        let turn_detection = if config.vad.enabled {
            Nullable::Value(TurnDetection {
                kind: TurnDetection::SERVER_VAD.to_string(),
                threshold: config.vad.threshold,
                prefix_padding_ms: config.vad.prefix_padding_ms,
                silence_duration_ms: config.vad.silence_duration_ms,
                create_response: Some(!config.transcription_only),
                interrupt_response: None,
            })
        } else {
            Nullable::Null
        };
        let tools: Vec<FunctionTool> = config
            .tools
            .iter()
            .map(|tool| FunctionTool {
                kind: "function".to_string(),
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            })
            .collect();

        let mut update = SessionUpdate {
            modalities: Some(modalities),
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some(self.dialect.output_audio_format().to_string()),
            input_audio_transcription: config
                .input_transcription
                .clone()
                .map(|model| InputAudioTranscription { model }),
            turn_detection: Some(turn_detection),
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            tools: (!tools.is_empty()).then_some(tools),
            temperature: generation.temperature,
            extra: config.extensions.clone(),
            ..SessionUpdate::default()
        };
        match self.dialect {
            Dialect::OpenAi => {
                update.max_response_output_tokens = generation.max_tokens;
                update.prompt = config.prompt.as_ref().map(|prompt| PromptRef {
                    id: prompt.id.clone(),
                    version: prompt.version.clone(),
                    variables: (!prompt.variables.is_empty()).then(|| prompt.variables.clone()),
                });
            }
            Dialect::DashScope => {
                update.max_tokens = generation.max_tokens;
                update.top_p = generation.top_p;
                update.top_k = generation.top_k;
                update.repetition_penalty = generation.repetition_penalty;
                update.presence_penalty = generation.presence_penalty;
                update.seed = generation.seed;
                update.smooth_output = config.smooth_output;
            }
        }
        update
    }

    fn session_update_frame(&self) -> Result<String> {
        let event = ClientEvent::SessionUpdate {
            event_id: None,
            session: Box::new(self.session_update()),
        };
        tracing::debug!(provider = self.dialect.provider_name(), kind = event.kind(), "configuring session");
        Ok(serde_json::to_string(&event)?)
    }

    fn push_text(&mut self, delta: String, out: &mut Decoded) {
        if delta.is_empty() {
            return;
        }
        if let Some(message) = self.turn.push(StreamChunk::Text(delta)) {
            out.emit(SessionEvent::text_delta(message, false));
        }
    }

    fn push_fragment(&mut self, fragment: ToolCallFragment) {
        self.turn.push(StreamChunk::ToolCall(fragment));
    }

    fn finish_response(&mut self, response: &ResponseInfo, out: &mut Decoded) {
        let turn = std::mem::take(&mut self.turn);
        self.streamed_calls.clear();
        self.active_response = None;

        if response.is_cancelled() {
            out.emit(SessionEvent::interrupted());
        }
        let message = turn.finish();
        if let Some(message) = message.as_ref().filter(|message| message.has_tool_use()) {
            let calls = message
                .content
                .iter()
                .filter(|block| block.is_tool_use())
                .cloned()
                .collect();
            out.emit(SessionEvent::tool_call(LiveMessage::assistant(calls), true));
        }
        out.emit(SessionEvent::turn_complete(message));
        if let Some(usage) = response.usage {
            out.emit(SessionEvent::usage_metadata(LiveMessage::usage(UsageInfo {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_tokens: usage.total_tokens,
            })));
        }
    }

    fn control_event(&self, signal: ControlSignal) -> ClientEvent {
        match signal.kind {
            ControlKind::Commit => ClientEvent::InputAudioBufferCommit { event_id: None },
            ControlKind::Clear => ClientEvent::InputAudioBufferClear { event_id: None },
            ControlKind::Interrupt => ClientEvent::ResponseCancel {
                event_id: None,
                response_id: signal
                    .parameter("response_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| self.active_response.clone()),
            },
            ControlKind::CreateResponse => ClientEvent::ResponseCreate {
                event_id: None,
                response: (!signal.parameters.is_empty()).then_some(signal.parameters),
            },
        }
    }
}

impl WireCodec for RealtimeCodec {
    fn provider_name(&self) -> &'static str {
        self.dialect.provider_name()
    }

    fn connect_request(&self) -> Result<ConnectRequest> {
        let mut url = self.endpoint.base_url.clone();
        url.query_pairs_mut().append_pair("model", &self.endpoint.model);
        let request = ConnectRequest::new(url)
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key));
        Ok(match self.dialect {
            Dialect::OpenAi => request.header("OpenAI-Beta", "realtime=v1"),
            Dialect::DashScope => request,
        })
    }

    // The server speaks first with `session.created`.
    fn on_open(&mut self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn decode(&mut self, frame: &str) -> Decoded {
        let mut out = Decoded::default();
        let event = match ServerEvent::parse(frame) {
            Ok(event) => event,
            Err(err) => {
                out.fail(err);
                return out;
            }
        };
        let provider = self.provider_name();
        match event {
            ServerEvent::SessionCreated { session, .. } => {
                tracing::debug!(provider, session_id = ?session.id, "session created; sending configuration");
                match self.session_update_frame() {
                    Ok(reply) => out.reply(reply),
                    Err(err) => out.fail(err),
                }
            }
            ServerEvent::SessionUpdated { .. } => out.ready = true,
            ServerEvent::Error { error, .. } => {
                tracing::warn!(provider, code = ?error.code, "server error: {}", error.message);
                out.fail(crate::Error::Api { provider, error });
            }
            ServerEvent::InputAudioBufferSpeechStarted { .. } => out.emit(SessionEvent::speech_started()),
            ServerEvent::InputAudioBufferSpeechStopped { .. } => out.emit(SessionEvent::speech_stopped()),
            ServerEvent::InputAudioTranscriptionCompleted { transcript, .. } => {
                if !transcript.is_empty() {
                    out.emit(SessionEvent::text_delta(LiveMessage::user_text(transcript), true));
                }
            }
            ServerEvent::ResponseCreated { response } => {
                self.turn = ReconstructionContext::new();
                self.streamed_calls.clear();
                self.active_response = response.id;
            }
            ServerEvent::ResponseTextDelta { delta, .. }
            | ServerEvent::ResponseAudioTranscriptDelta { delta, .. } => self.push_text(delta, &mut out),
            ServerEvent::ResponseAudioDelta { delta, .. } => match BASE64.decode(delta.as_bytes()) {
                Ok(bytes) => out.emit(SessionEvent::audio_delta(
                    LiveMessage::audio(AudioPayload::pcm16(bytes, OUTPUT_SAMPLE_RATE_HZ)),
                    false,
                )),
                Err(err) => out.fail(
                    ProtocolError::new("audio delta is not valid base64", Some(delta.as_str())).with_source(err),
                ),
            },
            ServerEvent::ResponseAudioDone { .. } => out.emit(SessionEvent::audio_delta(
                LiveMessage::audio(AudioPayload::pcm16(Vec::new(), OUTPUT_SAMPLE_RATE_HZ)),
                true,
            )),
            ServerEvent::ResponseOutputItemAdded { item, .. } if item.is_function_call() => {
                self.push_fragment(ToolCallFragment {
                    id: item.call_id,
                    name: item.name,
                    arguments: None,
                    raw: None,
                });
            }
            ServerEvent::ResponseFunctionCallArgumentsDelta { call_id, delta, .. } => {
                if let Some(id) = &call_id {
                    self.streamed_calls.insert(id.clone());
                }
                self.push_fragment(ToolCallFragment {
                    id: call_id,
                    name: None,
                    arguments: None,
                    raw: Some(delta),
                });
            }
            ServerEvent::ResponseFunctionCallArgumentsDone { call_id, name, arguments } => {
                let streamed = call_id
                    .as_ref()
                    .is_some_and(|id| self.streamed_calls.contains(id));
                self.push_fragment(ToolCallFragment {
                    id: call_id,
                    name,
                    arguments: None,
                    raw: (!streamed).then_some(arguments),
                });
            }
            ServerEvent::ResponseDone { response } => self.finish_response(&response, &mut out),
            ServerEvent::Unknown(value) => {
                let kind = value.get("type").and_then(Value::as_str).unwrap_or("unknown");
                if QUIET_TYPES.contains(&kind) {
                    tracing::trace!(provider, kind, "ignoring lifecycle event");
                } else {
                    out.emit(SessionEvent::unknown(kind, Some(frame)));
                }
            }
            other => tracing::trace!(provider, kind = other.type_name(), "ignoring event"),
        }
        out
    }

    fn encode(&mut self, input: LiveInput) -> Result<Vec<String>> {
        let event = match input {
            LiveInput::Audio(payload) => {
                if payload.is_empty() {
                    return Ok(Vec::new());
                }
                ClientEvent::InputAudioBufferAppend {
                    event_id: None,
                    audio: BASE64.encode(&payload.data),
                }
            }
            LiveInput::Text(text) => ClientEvent::ConversationItemCreate {
                event_id: None,
                item: Box::new(Item::Message {
                    role: "user".to_string(),
                    content: vec![ContentPart::InputText { text }],
                }),
            },
            LiveInput::Control(signal) => self.control_event(signal),
            LiveInput::ToolResult { call_id, output, .. } => ClientEvent::ConversationItemCreate {
                event_id: None,
                item: Box::new(Item::FunctionCallOutput {
                    call_id,
                    output: match output {
                        Value::String(text) => text,
                        other => other.to_string(),
                    },
                }),
            },
        };
        tracing::trace!(provider = self.dialect.provider_name(), kind = event.kind(), "encoding input");
        Ok(vec![serde_json::to_string(&event)?])
    }

    fn on_link_lost(&mut self) {
        self.turn = ReconstructionContext::new();
        self.streamed_calls.clear();
        self.active_response = None;
    }
}
