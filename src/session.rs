//! The live session actor.
//!
//! One task owns the transport, the codec and the state machine. Callers talk to it through a
//! command channel and read canonical events from a bounded channel. When the link drops the
//! actor walks `Disconnected → Reconnecting → Resuming → Recovered`, or ends in `Failed`.

use crate::connection::{ConnectionState, ConnectionStateMachine, ReconnectPolicy, StateTransitionEvent};
use crate::control::ControlSignal;
use crate::error::TransportError;
use crate::event::SessionEvent;
use crate::message::AudioPayload;
use crate::provider::WireCodec;
use crate::transport::{CloseInfo, Connector, InboundStream, Transport};
use crate::{Error, Result};
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const INBOUND_CHANNEL_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Anything a caller can push into a live session.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveInput {
    Audio(AudioPayload),
    Text(String),
    Control(ControlSignal),
    /// Result of a tool the model asked for.
    ToolResult {
        call_id: String,
        name: String,
        output: Value,
    },
}

impl From<AudioPayload> for LiveInput {
    fn from(payload: AudioPayload) -> Self {
        Self::Audio(payload)
    }
}

impl From<ControlSignal> for LiveInput {
    fn from(signal: ControlSignal) -> Self {
        Self::Control(signal)
    }
}

enum Command {
    Send {
        input: LiveInput,
        respond: oneshot::Sender<Result<()>>,
    },
    Close {
        respond: oneshot::Sender<()>,
    },
}

/// Cloneable sending half of a [`LiveSession`].
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    /// Raised before the close command is queued so a blocked actor stops waiting on readers.
    closing: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Send one input.
    ///
    /// # Errors
    /// Fails fast with [`TransportError::NotSendable`] outside `Connected`/`Recovered`,
    /// returns [`Error::SessionClosed`] once the session is gone, and otherwise reports
    /// encoding or write failures.
    pub async fn send(&self, input: LiveInput) -> Result<()> {
        let state = self.state();
        if !state.can_send() {
            return Err(TransportError::NotSendable(state).into());
        }
        let (respond, rx) = oneshot::channel();
        self.sender
            .send(Command::Send { input, respond })
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// # Errors
    /// See [`SessionHandle::send`].
    pub async fn send_audio(&self, payload: AudioPayload) -> Result<()> {
        self.send(LiveInput::Audio(payload)).await
    }

    /// # Errors
    /// See [`SessionHandle::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(LiveInput::Text(text.into())).await
    }

    /// # Errors
    /// See [`SessionHandle::send`].
    pub async fn send_control(&self, signal: ControlSignal) -> Result<()> {
        self.send(LiveInput::Control(signal)).await
    }

    /// # Errors
    /// See [`SessionHandle::send`].
    pub async fn send_tool_result(
        &self,
        call_id: impl Into<String>,
        name: impl Into<String>,
        output: Value,
    ) -> Result<()> {
        self.send(LiveInput::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            output,
        })
        .await
    }

    /// Close the session. Safe to call any number of times, and never waits on
    /// undrained events.
    pub async fn close(&self) {
        self.closing.send_replace(true);
        let (respond, rx) = oneshot::channel();
        if self.sender.send(Command::Close { respond }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }
}

/// A running duplex session.
///
/// Events must be drained; the actor applies backpressure once the event buffer is full.
/// [`LiveSession::close`] still completes when nobody reads; pending events are dropped.
/// Each item is either an event or an error. [`Error::is_terminal`] errors are followed by a
/// `session_ended` event, after which the stream ends.
pub struct LiveSession {
    handle: SessionHandle,
    events: mpsc::Receiver<Result<SessionEvent>>,
    transitions: broadcast::Sender<StateTransitionEvent>,
    provider: &'static str,
}

impl LiveSession {
    /// Open the first link and spawn the actor.
    pub(crate) async fn start(
        codec: Box<dyn WireCodec>,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        let provider = codec.provider_name();
        let request = codec.connect_request()?;
        tracing::info!(provider, "opening live session");
        let mut transport = connector.open(&request).await?;
        let inbound = transport.receive()?;

        let mut machine = ConnectionStateMachine::new();
        let transitions = machine.transition_sender();
        let state = machine.watch();
        let opened = machine.transition(ConnectionState::Connected, "transport opened")?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (closing_tx, closing_rx) = watch::channel(false);

        let mut actor = SessionActor {
            provider,
            codec,
            connector,
            policy,
            machine,
            events: event_tx,
            closing: closing_rx,
            frames: frame_tx,
            link: None,
            generation: 0,
            ready: false,
            attempt: 0,
        };
        actor.attach(transport, inbound);
        tokio::spawn(actor.run(command_rx, frame_rx, opened));

        Ok(Self {
            handle: SessionHandle {
                sender: command_tx,
                state,
                closing: Arc::new(closing_tx),
            },
            events: event_rx,
            transitions,
            provider,
        })
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    #[must_use]
    pub const fn provider_name(&self) -> &'static str {
        self.provider
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Transitions from now on. Every transition is also mirrored as a
    /// `connection_state` event on the main stream.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransitionEvent> {
        self.transitions.subscribe()
    }

    /// # Errors
    /// See [`SessionHandle::send`].
    pub async fn send(&self, input: LiveInput) -> Result<()> {
        self.handle.send(input).await
    }

    /// # Errors
    /// See [`SessionHandle::send`].
    pub async fn send_audio(&self, payload: AudioPayload) -> Result<()> {
        self.handle.send_audio(payload).await
    }

    /// # Errors
    /// See [`SessionHandle::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.handle.send_text(text).await
    }

    /// # Errors
    /// See [`SessionHandle::send`].
    pub async fn send_control(&self, signal: ControlSignal) -> Result<()> {
        self.handle.send_control(signal).await
    }

    /// # Errors
    /// See [`SessionHandle::send`].
    pub async fn send_tool_result(
        &self,
        call_id: impl Into<String>,
        name: impl Into<String>,
        output: Value,
    ) -> Result<()> {
        self.handle.send_tool_result(call_id, name, output).await
    }

    /// Next item, or `None` once the session has ended.
    pub async fn next_event(&mut self) -> Option<Result<SessionEvent>> {
        self.events.recv().await
    }

    pub fn events(&mut self) -> EventStream<'_> {
        EventStream::new(&mut self.events)
    }

    /// Consume the session into an owned stream. The session stays open until the
    /// stream is dropped.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, Result<SessionEvent>> {
        let Self { handle, events, .. } = self;
        futures::stream::unfold((events, handle), |(mut events, handle)| async move {
            let item = events.recv().await?;
            Some((item, (events, handle)))
        })
        .boxed()
    }

    pub async fn close(&self) {
        self.handle.close().await;
    }
}

/// Borrowed stream over a session's events.
pub struct EventStream<'a> {
    rx: &'a mut mpsc::Receiver<Result<SessionEvent>>,
}

impl<'a> EventStream<'a> {
    #[must_use]
    pub const fn new(rx: &'a mut mpsc::Receiver<Result<SessionEvent>>) -> Self {
        Self { rx }
    }
}

impl Stream for EventStream<'_> {
    type Item = Result<SessionEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll_recv(cx)
    }
}

enum Inbound {
    Frame(String),
    Failed(Error),
    Ended,
}

enum Wake {
    Command(Option<Command>),
    Inbound(u64, Inbound),
    Retry,
}

enum Flow {
    Continue,
    Retry(Duration),
    Stop,
}

struct Link {
    transport: Box<dyn Transport<String>>,
    reader: JoinHandle<()>,
}

struct SessionActor {
    provider: &'static str,
    codec: Box<dyn WireCodec>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    machine: ConnectionStateMachine,
    events: mpsc::Sender<Result<SessionEvent>>,
    closing: watch::Receiver<bool>,
    frames: mpsc::Sender<(u64, Inbound)>,
    link: Option<Link>,
    /// Bumped whenever a link is attached or released; frames tagged with an older
    /// value are dropped.
    generation: u64,
    ready: bool,
    attempt: u32,
}

impl SessionActor {
    fn attach(&mut self, transport: Box<dyn Transport<String>>, inbound: InboundStream<String>) {
        self.generation += 1;
        let generation = self.generation;
        let frames = self.frames.clone();
        let reader = tokio::spawn(async move {
            let mut inbound = inbound;
            while let Some(item) = inbound.next().await {
                let (message, failed) = match item {
                    Ok(frame) => (Inbound::Frame(frame), false),
                    Err(err) => (Inbound::Failed(err), true),
                };
                if frames.send((generation, message)).await.is_err() || failed {
                    return;
                }
            }
            let _ = frames.send((generation, Inbound::Ended)).await;
        });
        self.link = Some(Link { transport, reader });
        self.ready = false;
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut frames: mpsc::Receiver<(u64, Inbound)>,
        opened: StateTransitionEvent,
    ) {
        self.publish(&opened).await;
        let mut retry: Option<Pin<Box<Sleep>>> = None;
        let mut flow = self.open_link().await;
        loop {
            match flow {
                Flow::Stop => break,
                Flow::Retry(delay) => retry = Some(Box::pin(tokio::time::sleep(delay))),
                Flow::Continue => {}
            }
            let wake = tokio::select! {
                biased;
                command = commands.recv() => Wake::Command(command),
                Some((generation, inbound)) = frames.recv() => Wake::Inbound(generation, inbound),
                () = retry_timer(&mut retry) => Wake::Retry,
            };
            flow = match wake {
                Wake::Command(Some(Command::Send { input, respond })) => {
                    let _ = respond.send(self.send(input).await);
                    Flow::Continue
                }
                Wake::Command(Some(Command::Close { respond })) => {
                    self.shutdown("closed by client").await;
                    let _ = respond.send(());
                    Flow::Stop
                }
                Wake::Command(None) => {
                    self.shutdown("session dropped").await;
                    Flow::Stop
                }
                Wake::Inbound(generation, _) if generation != self.generation => {
                    tracing::trace!(provider = self.provider, generation, "dropping frame from a replaced link");
                    Flow::Continue
                }
                Wake::Inbound(_, Inbound::Frame(frame)) => self.on_frame(&frame).await,
                Wake::Inbound(_, Inbound::Failed(err)) => self.on_link_lost(Some(err)).await,
                Wake::Inbound(_, Inbound::Ended) => self.on_link_lost(None).await,
                Wake::Retry => {
                    retry = None;
                    self.reconnect().await
                }
            };
        }
        self.release_link().await;
        tracing::debug!(provider = self.provider, "session actor stopped");
    }

    async fn send(&mut self, input: LiveInput) -> Result<()> {
        let state = self.machine.state();
        if !state.can_send() {
            return Err(TransportError::NotSendable(state).into());
        }
        for frame in self.codec.encode(input)? {
            self.write(frame).await?;
        }
        Ok(())
    }

    async fn write(&mut self, frame: String) -> Result<()> {
        let link = self.link.as_mut().ok_or(TransportError::NotOpen)?;
        link.transport.send(frame).await
    }

    /// Send the codec's opening frames on a fresh link.
    async fn open_link(&mut self) -> Flow {
        let opening = match self.codec.on_open() {
            Ok(frames) => frames,
            Err(err) => return self.fail(err, "could not prepare the handshake").await,
        };
        for frame in opening {
            if let Err(err) = self.write(frame).await {
                return self.on_link_lost(Some(err)).await;
            }
        }
        Flow::Continue
    }

    async fn on_frame(&mut self, frame: &str) -> Flow {
        let decoded = self.codec.decode(frame);
        for item in decoded.items {
            self.emit(item).await;
        }
        for reply in decoded.replies {
            if let Err(err) = self.write(reply).await {
                return self.on_link_lost(Some(err)).await;
            }
        }
        if decoded.ready && !self.ready {
            self.ready = true;
            if self.machine.state() == ConnectionState::Resuming {
                let attempt = self.attempt;
                self.transition(ConnectionState::Recovered, "session resumed", None).await;
                self.emit(Ok(SessionEvent::reconnected())).await;
                tracing::info!(provider = self.provider, attempt, "session recovered");
                self.attempt = 0;
            } else {
                tracing::info!(provider = self.provider, "session ready");
            }
        }
        Flow::Continue
    }

    async fn on_link_lost(&mut self, err: Option<Error>) -> Flow {
        let close = self.link.as_ref().and_then(|link| link.transport.close_info());
        self.release_link().await;
        self.codec.on_link_lost();
        let reason = match (&err, &close) {
            (Some(err), _) => err.to_string(),
            (None, Some(info)) => format!("connection closed: {info}"),
            (None, None) => "connection closed".to_string(),
        };
        let error = err.unwrap_or_else(|| {
            TransportError::Closed(close.unwrap_or_else(|| CloseInfo::new(CloseInfo::ABNORMAL, "")))
                .into()
        });

        match self.machine.state() {
            ConnectionState::Connected if !self.ready => {
                self.fail(error, &format!("link lost during handshake: {reason}")).await
            }
            ConnectionState::Resuming => {
                let failure = self
                    .policy
                    .exhausted(self.attempt)
                    .with_last_error(&reason);
                self.fail(failure.into(), "link lost while resuming").await
            }
            ConnectionState::Connected | ConnectionState::Recovered => {
                if !self.policy.is_enabled() {
                    return self.fail(error, "link lost and reconnection is disabled").await;
                }
                tracing::warn!(provider = self.provider, %reason, "link lost");
                self.transition(ConnectionState::Disconnected, &reason, Some(reason.clone()))
                    .await;
                self.schedule_retry(1, &reason).await
            }
            state => {
                tracing::debug!(provider = self.provider, %state, "ignoring link loss");
                Flow::Continue
            }
        }
    }

    async fn schedule_retry(&mut self, attempt: u32, reason: &str) -> Flow {
        self.attempt = attempt;
        if self.machine.state() != ConnectionState::Reconnecting {
            self.transition(ConnectionState::Reconnecting, reason, None).await;
        }
        self.emit(Ok(SessionEvent::reconnecting(attempt, self.policy.max_attempts)))
            .await;
        let delay = self.policy.delay(attempt);
        tracing::info!(
            provider = self.provider,
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        Flow::Retry(delay)
    }

    async fn reconnect(&mut self) -> Flow {
        let attempt = self.attempt;
        match self.open_transport().await {
            Ok((transport, inbound)) => {
                self.attach(transport, inbound);
                self.transition(ConnectionState::Resuming, "transport reopened", None).await;
                self.open_link().await
            }
            Err(err) => {
                tracing::warn!(provider = self.provider, attempt, error = %err, "reconnect attempt failed");
                if attempt >= self.policy.max_attempts {
                    let failure = self.policy.exhausted(attempt).with_last_error(&err);
                    return self.fail(failure.into(), "reconnect attempts exhausted").await;
                }
                self.schedule_retry(attempt + 1, &err.to_string()).await
            }
        }
    }

    async fn open_transport(&mut self) -> Result<(Box<dyn Transport<String>>, InboundStream<String>)> {
        let request = self.codec.connect_request()?;
        let mut transport = self.connector.open(&request).await?;
        let inbound = transport.receive()?;
        Ok((transport, inbound))
    }

    /// Enter `Failed`, surface `error`, then end the stream.
    async fn fail(&mut self, error: Error, reason: &str) -> Flow {
        tracing::warn!(provider = self.provider, error = %error, "{reason}");
        let message = error.to_string();
        self.transition(ConnectionState::Failed, reason, Some(message)).await;
        self.emit(Err(error)).await;
        self.emit(Ok(SessionEvent::session_ended(reason, false))).await;
        self.release_link().await;
        Flow::Stop
    }

    async fn shutdown(&mut self, reason: &str) {
        self.release_link().await;
        if !self.machine.state().is_terminal() {
            self.transition(ConnectionState::Closed, reason, None).await;
            self.emit(Ok(SessionEvent::session_ended(reason, false))).await;
        }
        tracing::info!(provider = self.provider, reason, "session closed");
    }

    async fn release_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        // Frames still queued from this link are stale from here on.
        self.generation += 1;
        link.reader.abort();
        let mut transport = link.transport;
        match tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(provider = self.provider, error = %err, "error while closing link"),
            Err(_) => tracing::debug!(provider = self.provider, "timed out closing link"),
        }
    }

    async fn transition(&mut self, to: ConnectionState, reason: &str, error: Option<String>) {
        let mut event = StateTransitionEvent::new(self.machine.state(), to, reason).with_attempt(self.attempt);
        if let Some(error) = error {
            event = event.with_error(error);
        }
        match self.machine.apply(event) {
            Ok(applied) => self.publish(&applied).await,
            Err(err) => tracing::error!(provider = self.provider, error = %err, "rejected state transition"),
        }
    }

    async fn publish(&mut self, transition: &StateTransitionEvent) {
        let state = transition.current_state;
        self.emit(Ok(SessionEvent::connection_state(
            state.as_str(),
            transition.reason.clone(),
            !state.is_terminal(),
        )))
        .await;
    }

    /// Queue an item for the consumer. Once a close is requested nothing waits for
    /// buffer space; items that do not fit are dropped.
    async fn emit(&mut self, item: Result<SessionEvent>) {
        let closing = *self.closing.borrow();
        if closing {
            if self.events.try_send(item).is_err() {
                tracing::trace!(provider = self.provider, "event dropped while closing");
            }
            return;
        }
        tokio::select! {
            sent = self.events.send(item) => {
                if sent.is_err() {
                    tracing::trace!(provider = self.provider, "event receiver dropped");
                }
            }
            () = close_requested(&mut self.closing) => {
                tracing::debug!(provider = self.provider, "event dropped while closing");
            }
        }
    }
}

/// Resolves once a close has been requested; never resolves if every handle is gone.
async fn close_requested(closing: &mut watch::Receiver<bool>) {
    loop {
        let requested = *closing.borrow_and_update();
        if requested {
            return;
        }
        if closing.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves when the pending retry delay elapses; never resolves when none is pending.
fn retry_timer(retry: &mut Option<Pin<Box<Sleep>>>) -> impl Future<Output = ()> + '_ {
    async move {
        match retry {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }
}
