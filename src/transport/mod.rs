pub mod ws;

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

pub use ws::{WsConnector, WsPayload, WsTransport};

/// Inbound side of a transport. Ends when the peer closes; yields `Err` on socket failure.
pub type InboundStream<M> = BoxStream<'static, Result<M>>;

/// Why a transport stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub const NORMAL: u16 = 1000;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;

    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_normal(&self) -> bool {
        self.code == Self::NORMAL
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {}: {}", self.code, self.reason)
        }
    }
}

/// A duplex message channel over one physical connection.
///
/// `M` is the frame payload, `String` for text frames or `Vec<u8>` for binary frames.
#[async_trait]
pub trait Transport<M>: Send
where
    M: Send + 'static,
{
    /// # Errors
    /// Fails with a transport error if the channel is not open or the write fails.
    async fn send(&mut self, message: M) -> Result<()>;

    /// Take the inbound stream. Only the first call succeeds.
    ///
    /// # Errors
    /// Fails with [`TransportError::AlreadyReceiving`](crate::error::TransportError::AlreadyReceiving)
    /// on every call after the first.
    fn receive(&mut self) -> Result<InboundStream<M>>;

    /// Close the channel. Closing twice is a no-op.
    ///
    /// # Errors
    /// Fails only if the close handshake could not be written.
    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// `None` until the channel has closed.
    fn close_info(&self) -> Option<CloseInfo>;
}

/// Where and how to open a transport.
#[derive(Clone)]
pub struct ConnectRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

const SECRET_HEADERS: [&str; 3] = ["authorization", "x-goog-api-key", "api-key"];

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                let secret = SECRET_HEADERS
                    .iter()
                    .any(|s| name.eq_ignore_ascii_case(s));
                (name.as_str(), if secret { "<redacted>" } else { value.as_str() })
            })
            .collect();
        f.debug_struct("ConnectRequest")
            .field("url", &redact_query(&self.url))
            .field("headers", &headers)
            .finish()
    }
}

fn redact_query(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let value = if k == "key" { "<redacted>".to_string() } else { v.into_owned() };
            (k.into_owned(), value)
        })
        .collect();
    if !pairs.is_empty() {
        shown.query_pairs_mut().clear().extend_pairs(pairs);
    }
    shown.to_string()
}

/// Opens text transports. Sessions use this to build and rebuild their link.
#[async_trait]
pub trait Connector: Send + Sync {
    /// # Errors
    /// Returns an error if the connection cannot be established.
    async fn open(&self, request: &ConnectRequest) -> Result<Box<dyn Transport<String>>>;
}
