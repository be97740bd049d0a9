use crate::connection::ReconnectPolicy;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Server-side voice activity detection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub enabled: bool,
    pub threshold: Option<f32>,
    pub silence_duration_ms: Option<u32>,
    pub prefix_padding_ms: Option<u32>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: None,
            silence_duration_ms: None,
            prefix_padding_ms: None,
        }
    }
}

/// Sampling parameters. Providers ignore the ones they do not support.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repetition_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub seed: Option<u64>,
    pub max_tokens: Option<u32>,
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters,
        }
    }

    /// Derive the parameter schema from `TArgs`.
    ///
    /// # Errors
    /// Returns an error if the generated schema cannot be serialized.
    pub fn for_args<TArgs: JsonSchema>(name: impl Into<String>) -> Result<Self> {
        let schema = schemars::schema_for!(TArgs);
        let mut parameters = serde_json::to_value(schema)?;
        if let Value::Object(map) = &mut parameters {
            map.remove("$schema");
            map.remove("title");
        }
        Ok(Self::new(name, parameters))
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Stored prompt reference (`OpenAI` prompt templates).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
}

/// Everything a provider needs to configure a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub vad: VadConfig,
    pub smooth_output: Option<bool>,
    pub generation: GenerationParams,
    /// Only transcribe input; the model never answers on its own.
    pub transcription_only: bool,
    /// Model used to transcribe input audio, if any.
    pub input_transcription: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub prompt: Option<PromptTemplate>,
    /// Extra fields merged verbatim into the vendor session payload.
    pub extensions: Map<String, Value>,
    pub reconnect: ReconnectPolicy,
    pub resumption_handle: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            voice: None,
            instructions: None,
            vad: VadConfig::default(),
            smooth_output: None,
            generation: GenerationParams::default(),
            transcription_only: false,
            input_transcription: None,
            tools: Vec::new(),
            prompt: None,
            extensions: Map::new(),
            reconnect: ReconnectPolicy::default(),
            resumption_handle: None,
        }
    }
}

impl LiveConfig {
    #[must_use]
    pub fn builder() -> LiveConfigBuilder {
        LiveConfigBuilder::default()
    }

    /// # Errors
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let g = &self.generation;
        check_range("temperature", g.temperature, 0.0, 2.0)?;
        check_range("top_p", g.top_p, 0.0, 1.0)?;
        check_range("vad.threshold", self.vad.threshold, 0.0, 1.0)?;
        if g.top_k == Some(0) {
            return Err(Error::Config("top_k must be positive".to_string()));
        }
        if g.max_tokens == Some(0) {
            return Err(Error::Config("max_tokens must be positive".to_string()));
        }
        if let Some(tool) = self.tools.iter().find(|t| t.name.trim().is_empty()) {
            return Err(Error::Config(format!(
                "tool name must not be empty (description: {:?})",
                tool.description
            )));
        }
        if let Some(prompt) = &self.prompt {
            if prompt.id.trim().is_empty() {
                return Err(Error::Config("prompt id must not be empty".to_string()));
            }
        }
        self.reconnect.validate()
    }
}

#[allow(clippy::result_large_err)]
fn check_range(field: &str, value: Option<f32>, min: f32, max: f32) -> Result<()> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(Error::Config(format!(
            "{field} must be within {min}..={max}, got {v}"
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
pub struct LiveConfigBuilder {
    config: LiveConfig,
}

impl LiveConfigBuilder {
    #[must_use]
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.config.voice = Some(voice.into());
        self
    }

    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.instructions = Some(instructions.into());
        self
    }

    #[must_use]
    pub const fn vad_enabled(mut self, enabled: bool) -> Self {
        self.config.vad.enabled = enabled;
        self
    }

    #[must_use]
    pub const fn vad_threshold(mut self, threshold: f32) -> Self {
        self.config.vad.threshold = Some(threshold);
        self
    }

    #[must_use]
    pub const fn vad_silence_duration_ms(mut self, ms: u32) -> Self {
        self.config.vad.silence_duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn vad_prefix_padding_ms(mut self, ms: u32) -> Self {
        self.config.vad.prefix_padding_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn smooth_output(mut self, smooth: bool) -> Self {
        self.config.smooth_output = Some(smooth);
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.config.generation.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub const fn top_p(mut self, top_p: f32) -> Self {
        self.config.generation.top_p = Some(top_p);
        self
    }

    #[must_use]
    pub const fn top_k(mut self, top_k: u32) -> Self {
        self.config.generation.top_k = Some(top_k);
        self
    }

    #[must_use]
    pub const fn repetition_penalty(mut self, penalty: f32) -> Self {
        self.config.generation.repetition_penalty = Some(penalty);
        self
    }

    #[must_use]
    pub const fn presence_penalty(mut self, penalty: f32) -> Self {
        self.config.generation.presence_penalty = Some(penalty);
        self
    }

    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.generation.seed = Some(seed);
        self
    }

    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.generation.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub const fn transcription_only(mut self, enabled: bool) -> Self {
        self.config.transcription_only = enabled;
        self
    }

    #[must_use]
    pub fn input_transcription(mut self, model: impl Into<String>) -> Self {
        self.config.input_transcription = Some(model.into());
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.config.tools.push(tool);
        self
    }

    #[must_use]
    pub fn prompt(mut self, prompt: PromptTemplate) -> Self {
        self.config.prompt = Some(prompt);
        self
    }

    #[must_use]
    pub fn extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.extensions.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    #[must_use]
    pub fn resumption_handle(mut self, handle: impl Into<String>) -> Self {
        self.config.resumption_handle = Some(handle.into());
        self
    }

    /// # Errors
    /// Returns [`Error::Config`] if the assembled configuration is invalid.
    pub fn build(self) -> Result<LiveConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(JsonSchema)]
    #[allow(dead_code)]
    struct WeatherArgs {
        city: String,
        days: Option<u8>,
    }

    #[test]
    fn builder_collects_fields() {
        let config = LiveConfig::builder()
            .voice("alloy")
            .instructions("be nice")
            .vad_threshold(0.6)
            .vad_silence_duration_ms(400)
            .temperature(0.8)
            .top_k(40)
            .seed(7)
            .smooth_output(true)
            .extension("custom", 1)
            .build()
            .unwrap();
        assert_eq!(config.voice.as_deref(), Some("alloy"));
        assert!(config.vad.enabled);
        assert_eq!(config.vad.threshold, Some(0.6));
        assert_eq!(config.generation.top_k, Some(40));
        assert_eq!(config.extensions["custom"], 1);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        assert!(LiveConfig::builder().temperature(3.5).build().is_err());
        assert!(LiveConfig::builder().vad_threshold(1.5).build().is_err());
        assert!(LiveConfig::builder().top_k(0).build().is_err());
        assert!(LiveConfig::builder()
            .tool(ToolDefinition::new(" ", serde_json::json!({})))
            .build()
            .is_err());
        let bad_policy = ReconnectPolicy::default().with_jitter(2.0);
        assert!(LiveConfig::builder().reconnect(bad_policy).build().is_err());
    }

    #[test]
    fn tool_schema_from_type() {
        let tool = ToolDefinition::for_args::<WeatherArgs>("get_weather")
            .unwrap()
            .with_description("Look up the weather");
        assert_eq!(tool.parameters["type"], "object");
        assert!(tool.parameters["properties"]["city"].is_object());
        assert!(tool.parameters.get("$schema").is_none());
        assert_eq!(tool.parameters["required"], serde_json::json!(["city"]));
    }

    #[test]
    fn deserializes_partial_json() {
        let config: LiveConfig = serde_json::from_value(serde_json::json!({
            "voice": "Puck",
            "vad": { "enabled": false },
            "reconnect": { "max_attempts": 0 }
        }))
        .unwrap();
        assert!(!config.vad.enabled);
        assert_eq!(config.reconnect.max_attempts, 0);
        assert!(config.tools.is_empty());
    }
}
