use super::compat::{Dialect, RealtimeCodec};
use super::{Endpoint, LiveProvider, env_api_key};
use crate::config::LiveConfig;
use crate::session::LiveSession;
use crate::transport::Connector;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub const DEFAULT_BASE_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/realtime";
pub const DEFAULT_MODEL: &str = "qwen-omni-turbo-realtime";
const API_KEY_ENV: &str = "DASHSCOPE_API_KEY";

/// Alibaba `DashScope` (Qwen Omni) realtime endpoint. Speaks the `OpenAI` dialect with
/// extra sampling fields.
#[derive(Debug, Clone)]
pub struct DashScopeLiveProvider {
    endpoint: Endpoint,
}

impl DashScopeLiveProvider {
    /// # Errors
    /// Returns [`crate::Error::Config`] if the key or model is empty.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(api_key, model, DEFAULT_BASE_URL)?,
        })
    }

    /// # Errors
    /// Returns [`crate::Error::Config`] if `DASHSCOPE_API_KEY` is missing or empty.
    pub fn from_env() -> Result<Self> {
        Self::new(env_api_key(API_KEY_ENV)?, DEFAULT_MODEL)
    }

    /// International accounts use `wss://dashscope-intl.aliyuncs.com/api-ws/v1/realtime`.
    ///
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
impl LiveProvider for DashScopeLiveProvider {
    fn provider_name(&self) -> &'static str {
        Dialect::DashScope.provider_name()
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
        let codec = RealtimeCodec::new(Dialect::DashScope, self.endpoint.clone(), config);
        LiveSession::start(Box::new(codec), Arc::clone(&self.endpoint.connector), policy).await
    }
}
