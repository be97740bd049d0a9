#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use live_rt_rs::event::EventKind;
use live_rt_rs::transport::InboundStream;
use live_rt_rs::{
    CloseInfo, ConnectRequest, Connector, Error, LiveSession, Result, SessionEvent, Transport,
    TransportError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

/// The server's end of one mock link. Dropping it closes the link.
pub struct ServerSide {
    received: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<Result<String>>,
}

impl ServerSide {
    pub fn push(&self, frame: impl Into<String>) {
        self.outbound.send(Ok(frame.into())).expect("client link is gone");
    }

    pub fn push_json(&self, frame: &Value) {
        self.push(frame.to_string());
    }

    /// Stop accepting client frames; later client writes fail while inbound frames
    /// can still be pushed.
    pub fn stop_reading(&mut self) {
        self.received.close();
    }

    /// Break the link with a transport error instead of a clean end.
    pub fn break_link(self, err: Error) {
        let _ = self.outbound.send(Err(err));
    }

    pub async fn recv(&mut self) -> String {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the link")
    }

    pub async fn recv_json(&mut self) -> Value {
        serde_json::from_str(&self.recv().await).expect("client sent invalid JSON")
    }
}

struct MockTransport {
    sent: mpsc::UnboundedSender<String>,
    inbound: Option<mpsc::UnboundedReceiver<Result<String>>>,
    open: bool,
}

#[async_trait]
impl Transport<String> for MockTransport {
    async fn send(&mut self, message: String) -> Result<()> {
        if !self.open {
            return Err(TransportError::NotOpen.into());
        }
        self.sent
            .send(message)
            .map_err(|_| TransportError::Closed(CloseInfo::new(CloseInfo::ABNORMAL, "peer gone")).into())
    }

    fn receive(&mut self) -> Result<InboundStream<String>> {
        let rx = self.inbound.take().ok_or(TransportError::AlreadyReceiving)?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close_info(&self) -> Option<CloseInfo> {
        None
    }
}

/// Hands every opened link's server end to the test.
pub struct MockConnector {
    links: mpsc::UnboundedSender<ServerSide>,
    requests: Mutex<Vec<ConnectRequest>>,
    refuse: Mutex<u32>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            links,
            requests: Mutex::new(Vec::new()),
            refuse: Mutex::new(0),
        });
        (connector, rx)
    }

    /// Refuse the next `count` open attempts.
    pub fn refuse_next(&self, count: u32) {
        *self.refuse.lock() = count;
    }

    pub fn open_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn request(&self, index: usize) -> ConnectRequest {
        self.requests.lock()[index].clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, request: &ConnectRequest) -> Result<Box<dyn Transport<String>>> {
        self.requests.lock().push(request.clone());
        {
            let mut refuse = self.refuse.lock();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(TransportError::Closed(CloseInfo::new(CloseInfo::ABNORMAL, "connection refused")).into());
            }
        }
        let (sent, received) = mpsc::unbounded_channel();
        let (outbound, inbound) = mpsc::unbounded_channel();
        let _ = self.links.send(ServerSide { received, outbound });
        Ok(Box::new(MockTransport {
            sent,
            inbound: Some(inbound),
            open: true,
        }))
    }
}

pub async fn next_item(session: &mut LiveSession) -> Option<Result<SessionEvent>> {
    tokio::time::timeout(WAIT, session.next_event())
        .await
        .expect("timed out waiting for a session event")
}

/// Next successful event that is not a `connection_state` mirror.
pub async fn next_event(session: &mut LiveSession) -> SessionEvent {
    loop {
        let event = next_item(session)
            .await
            .expect("session ended")
            .expect("unexpected error item");
        if event.kind() != EventKind::ConnectionState {
            return event;
        }
    }
}

/// Everything until the stream ends.
pub async fn drain(session: &mut LiveSession) -> Vec<Result<SessionEvent>> {
    let mut items = Vec::new();
    while let Some(item) = next_item(session).await {
        items.push(item);
    }
    items
}

/// States announced by `connection_state` events, in order.
pub fn states(items: &[Result<SessionEvent>]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.as_ref().ok())
        .filter(|event| event.kind() == EventKind::ConnectionState)
        .filter_map(|event| event.metadata(live_rt_rs::event::keys::CONNECTION_STATE))
        .map(str::to_string)
        .collect()
}

pub async fn next_server(links: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    tokio::time::timeout(WAIT, links.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}
