use super::compat::{Dialect, RealtimeCodec};
use super::{Endpoint, LiveProvider, env_api_key};
use crate::config::LiveConfig;
use crate::session::LiveSession;
use crate::transport::Connector;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub const DEFAULT_BASE_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// `OpenAI` Realtime API.
#[derive(Debug, Clone)]
pub struct OpenAiLiveProvider {
    endpoint: Endpoint,
}

impl OpenAiLiveProvider {
    /// # Errors
    /// Returns [`crate::Error::Config`] if the key or model is empty.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(api_key, model, DEFAULT_BASE_URL)?,
        })
    }

    /// Reads `OPENAI_API_KEY` and uses the default model.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] if the variable is missing or empty.
    pub fn from_env() -> Result<Self> {
        Self::new(env_api_key(API_KEY_ENV)?, DEFAULT_MODEL)
    }

    /// # Errors
    /// Returns [`crate::Error::Url`] if `base_url` does not parse.
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
impl LiveProvider for OpenAiLiveProvider {
    fn provider_name(&self) -> &'static str {
        Dialect::OpenAi.provider_name()
    }

    fn model_name(&self) -> &str {
        self.endpoint.model()
    }

    fn supports_native_recovery(&self) -> bool {
        false
    }

    async fn connect(&self, config: LiveConfig) -> Result<LiveSession> {
        config.validate()?;
        let policy = config.reconnect.clone();
        let codec = RealtimeCodec::new(Dialect::OpenAi, self.endpoint.clone(), config);
        LiveSession::start(Box::new(codec), Arc::clone(&self.endpoint.connector), policy).await
    }
}
