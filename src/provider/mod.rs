//! Vendor adapters.
//!
//! Each provider pairs a [`WireCodec`] (vendor frames in, canonical events out) with a
//! [`Connector`]. The session actor drives the codec and never sees vendor JSON.

pub mod compat;
pub mod dashscope;
pub mod gemini;
pub mod openai;

pub use dashscope::DashScopeLiveProvider;
pub use gemini::GeminiLiveProvider;
pub use openai::OpenAiLiveProvider;

use crate::config::LiveConfig;
use crate::event::SessionEvent;
use crate::session::{LiveInput, LiveSession};
use crate::transport::{ConnectRequest, Connector, WsConnector};
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// A vendor that can open live sessions.
#[async_trait]
pub trait LiveProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    fn model_name(&self) -> &str;

    /// Whether the vendor can resume server-side state after a reconnect.
    fn supports_native_recovery(&self) -> bool;

    /// Open a session. Resolves once the transport is open; the handshake
    /// finishes on the event stream.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid or the transport cannot be opened.
    async fn connect(&self, config: LiveConfig) -> Result<LiveSession>;
}

/// What one inbound frame produced, in emission order.
#[derive(Debug, Default)]
pub struct Decoded {
    /// Events and non-terminal errors for the consumer.
    pub items: Vec<Result<SessionEvent>>,
    /// Frames to write back before anything else is sent.
    pub replies: Vec<String>,
    /// The handshake finished with this frame.
    pub ready: bool,
}

impl Decoded {
    pub(crate) fn emit(&mut self, event: SessionEvent) {
        self.items.push(Ok(event));
    }

    pub(crate) fn fail(&mut self, err: impl Into<Error>) {
        self.items.push(Err(err.into()));
    }

    pub(crate) fn reply(&mut self, frame: String) {
        self.replies.push(frame);
    }

    pub fn events(&self) -> impl Iterator<Item = &SessionEvent> {
        self.items.iter().filter_map(|item| item.as_ref().ok())
    }
}

/// Per-session translation between canonical inputs/events and vendor frames.
pub trait WireCodec: Send {
    fn provider_name(&self) -> &'static str;

    /// Where to connect. Called again before every reconnect.
    ///
    /// # Errors
    /// Returns an error if the endpoint cannot be built.
    fn connect_request(&self) -> Result<ConnectRequest>;

    /// Frames to send as soon as a link opens.
    ///
    /// # Errors
    /// Returns an error if the opening payload cannot be serialized.
    fn on_open(&mut self) -> Result<Vec<String>>;

    fn decode(&mut self, frame: &str) -> Decoded;

    /// # Errors
    /// Returns an error if the input cannot be expressed for this vendor.
    fn encode(&mut self, input: LiveInput) -> Result<Vec<String>>;

    /// The link dropped; discard any partially received turn.
    fn on_link_lost(&mut self);
}

/// Credentials, model and endpoint shared by every adapter.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) api_key: String,
    pub(crate) model: String,
    pub(crate) base_url: Url,
    pub(crate) connector: Arc<dyn Connector>,
}

impl Endpoint {
    /// # Errors
    /// Returns [`Error::Config`] for an empty key or model, or an invalid URL.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: &str) -> Result<Self> {
        let api_key = api_key.into();
        let model = model.into();
        if api_key.trim().is_empty() {
            return Err(Error::Config("api key must not be empty".to_string()));
        }
        if model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".to_string()));
        }
        Ok(Self {
            api_key,
            model,
            base_url: Url::parse(base_url)?,
            connector: Arc::new(WsConnector),
        })
    }

    pub(crate) fn set_base_url(&mut self, base_url: &str) -> Result<()> {
        self.base_url = Url::parse(base_url)?;
        Ok(())
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("model", &self.model)
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Read an API key from the environment.
pub(crate) fn env_api_key(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| Error::Config(format!("{var} is not set")))
}
