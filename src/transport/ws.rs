use super::{CloseInfo, ConnectRequest, Connector, InboundStream, Transport};
use crate::error::TransportError;
use crate::{Result, safe_truncate};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TRACE_LOG_MAX_BYTES: usize = 1024;

/// Frame payloads a [`WsTransport`] can carry.
pub trait WsPayload: Send + Sized + 'static {
    fn into_message(self) -> Message;

    /// `None` for frames of the other kind, which are skipped.
    fn from_message(message: Message) -> Option<Self>;
}

impl WsPayload for String {
    fn into_message(self) -> Message {
        Message::Text(self.into())
    }

    fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(text.as_str().to_owned()),
            _ => None,
        }
    }
}

impl WsPayload for Vec<u8> {
    fn into_message(self) -> Message {
        Message::Binary(self.into())
    }

    fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Binary(bytes) => Some(bytes.to_vec()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    open: bool,
    close_info: Option<CloseInfo>,
}

impl LinkState {
    fn mark_closed(&mut self, info: CloseInfo) {
        self.open = false;
        self.close_info.get_or_insert(info);
    }
}

/// WebSocket-backed [`Transport`].
pub struct WsTransport<M> {
    sink: SplitSink<Socket, Message>,
    stream: Option<SplitStream<Socket>>,
    link: Arc<Mutex<LinkState>>,
    _payload: PhantomData<fn() -> M>,
}

impl<M: WsPayload> WsTransport<M> {
    #[must_use]
    pub fn new(socket: Socket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink,
            stream: Some(stream),
            link: Arc::new(Mutex::new(LinkState {
                open: true,
                close_info: None,
            })),
            _payload: PhantomData,
        }
    }

    /// Open a WebSocket for `request`.
    ///
    /// # Errors
    /// Returns an error if a header is invalid or the handshake fails.
    pub async fn connect(request: &ConnectRequest) -> Result<Self> {
        let mut req = request.url.as_str().into_client_request()?;
        let headers = req.headers_mut();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| crate::Error::Config(format!("invalid header name {name}: {err}")))?;
            headers.insert(name, HeaderValue::from_str(value)?);
        }
        let (socket, _) = connect_async(req).await?;
        tracing::info!(host = request.url.host_str().unwrap_or_default(), "WebSocket connected");
        Ok(Self::new(socket))
    }
}

#[async_trait]
impl<M: WsPayload> Transport<M> for WsTransport<M> {
    async fn send(&mut self, message: M) -> Result<()> {
        if !self.link.lock().open {
            return Err(TransportError::NotOpen.into());
        }
        let message = message.into_message();
        if let Message::Text(text) = &message {
            tracing::trace!("Sending frame: {}", safe_truncate(text.as_str(), TRACE_LOG_MAX_BYTES));
        }
        if let Err(err) = self.sink.send(message).await {
            self.link
                .lock()
                .mark_closed(CloseInfo::new(CloseInfo::ABNORMAL, err.to_string()));
            return Err(err.into());
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<InboundStream<M>> {
        let stream = self.stream.take().ok_or(TransportError::AlreadyReceiving)?;
        let link = Arc::clone(&self.link);
        let inbound = futures::stream::unfold(Some(stream), move |state| {
            let link = Arc::clone(&link);
            async move {
                let mut stream = state?;
                loop {
                    match stream.next().await {
                        Some(Ok(Message::Close(frame))) => {
                            let info = frame.map_or_else(
                                || CloseInfo::new(CloseInfo::NO_STATUS, ""),
                                |f| CloseInfo::new(u16::from(f.code), f.reason.as_str()),
                            );
                            tracing::info!(%info, "WebSocket closed by peer");
                            link.lock().mark_closed(info);
                            return None;
                        }
                        Some(Ok(message)) => {
                            if let Message::Text(text) = &message {
                                tracing::trace!(
                                    "Received frame: {}",
                                    safe_truncate(text.as_str(), TRACE_LOG_MAX_BYTES)
                                );
                            }
                            // Ping/pong replies are handled by tungstenite on the next write.
                            if let Some(payload) = M::from_message(message) {
                                return Some((Ok(payload), Some(stream)));
                            }
                        }
                        Some(Err(err)) => {
                            link.lock()
                                .mark_closed(CloseInfo::new(CloseInfo::ABNORMAL, err.to_string()));
                            return Some((Err(TransportError::WebSocket(err).into()), None));
                        }
                        None => {
                            link.lock()
                                .mark_closed(CloseInfo::new(CloseInfo::ABNORMAL, "stream ended"));
                            return None;
                        }
                    }
                }
            }
        });
        Ok(inbound.boxed())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.link.lock().open {
            return Ok(());
        }
        self.link
            .lock()
            .mark_closed(CloseInfo::new(CloseInfo::NORMAL, "closed by client"));
        match self.sink.close().await {
            Ok(())
            | Err(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed,
            ) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.link.lock().open
    }

    fn close_info(&self) -> Option<CloseInfo> {
        self.link.lock().close_info.clone()
    }
}

/// Default [`Connector`] that opens real WebSockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, request: &ConnectRequest) -> Result<Box<dyn Transport<String>>> {
        let transport = WsTransport::<String>::connect(request).await?;
        Ok(Box::new(transport))
    }
}
