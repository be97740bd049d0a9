mod common;

use common::{MockConnector, drain, next_event, next_item, next_server, states};
use live_rt_rs::event::{EventKind, keys};
use live_rt_rs::{
    ConnectionState, ControlSignal, Error, GeminiLiveProvider, LiveConfig, LiveProvider,
    OpenAiLiveProvider, ReconnectPolicy, TransportError,
};
use serde_json::json;
use std::time::Duration;

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::default()
        .with_max_attempts(max_attempts)
        .with_delays(Duration::from_millis(10), Duration::from_millis(40))
        .with_jitter(0.0)
}

#[tokio::test]
async fn openai_handshake_then_text_turn() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk-test", "gpt-realtime")
        .unwrap()
        .with_connector(connector.clone());
    let config = LiveConfig::builder().voice("alloy").build().unwrap();
    let mut session = provider.connect(config).await.unwrap();
    assert_eq!(session.provider_name(), "openai");

    let request = connector.request(0);
    assert_eq!(request.header_value("Authorization"), Some("Bearer sk-test"));
    assert_eq!(request.url.query(), Some("model=gpt-realtime"));

    let first = next_item(&mut session).await.unwrap().unwrap();
    assert_eq!(first.kind(), EventKind::ConnectionState);
    assert_eq!(first.metadata(keys::CONNECTION_STATE), Some("connected"));

    let mut server = next_server(&mut links).await;
    server.push_json(&json!({"type": "session.created", "session": {"id": "sess_1"}}));
    let update = server.recv_json().await;
    assert_eq!(update["type"], "session.update");
    assert_eq!(update["session"]["voice"], "alloy");
    server.push_json(&json!({"type": "session.updated", "session": {}}));

    session.send_text("hello").await.unwrap();
    let item = server.recv_json().await;
    assert_eq!(item["type"], "conversation.item.create");
    session.send_control(ControlSignal::create_response()).await.unwrap();
    assert_eq!(server.recv_json().await["type"], "response.create");

    server.push_json(&json!({"type": "response.created", "response": {"id": "resp_1"}}));
    server.push_json(&json!({"type": "response.text.delta", "delta": "Hi "}));
    server.push_json(&json!({"type": "response.text.delta", "delta": "there"}));
    server.push_json(&json!({
        "type": "response.done",
        "response": {"id": "resp_1", "status": "completed", "usage": {"total_tokens": 7}}
    }));

    let delta = next_event(&mut session).await;
    assert_eq!(delta.kind(), EventKind::TextDelta);
    assert_eq!(delta.message().unwrap().text(), "Hi ");
    assert_eq!(next_event(&mut session).await.kind(), EventKind::TextDelta);
    let complete = next_event(&mut session).await;
    assert_eq!(complete.kind(), EventKind::TurnComplete);
    assert_eq!(complete.message().unwrap().text(), "Hi there");
    let usage = next_event(&mut session).await;
    assert_eq!(usage.kind(), EventKind::UsageMetadata);

    session.close().await;
}

#[tokio::test]
async fn invalid_config_fails_before_connecting() {
    let (connector, _links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector.clone());
    let config = LiveConfig {
        generation: live_rt_rs::GenerationParams {
            temperature: Some(9.0),
            ..Default::default()
        },
        ..LiveConfig::default()
    };
    assert!(matches!(provider.connect(config).await, Err(Error::Config(_))));
    assert_eq!(connector.open_count(), 0);
}

#[tokio::test]
async fn refused_connection_fails_connect() {
    let (connector, _links) = MockConnector::new();
    connector.refuse_next(1);
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector);
    assert!(matches!(
        provider.connect(LiveConfig::default()).await,
        Err(Error::Transport(_))
    ));
}

#[tokio::test]
async fn link_lost_during_handshake_is_terminal() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector.clone());
    let mut session = provider.connect(LiveConfig::default()).await.unwrap();
    drop(next_server(&mut links).await);

    let items = drain(&mut session).await;
    assert_eq!(states(&items), vec!["connected", "failed"]);
    let errors: Vec<&Error> = items.iter().filter_map(|item| item.as_ref().err()).collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_terminal());
    let last = items.last().unwrap().as_ref().unwrap();
    assert_eq!(last.kind(), EventKind::SessionEnded);
    assert_eq!(last.metadata(keys::SESSION_RECOVERABLE), Some("false"));

    assert_eq!(session.state(), ConnectionState::Failed);
    assert_eq!(connector.open_count(), 1);
    assert!(matches!(
        session.send_text("late").await,
        Err(Error::Transport(TransportError::NotSendable(ConnectionState::Failed)))
    ));
}

#[tokio::test]
async fn vendor_errors_do_not_end_the_stream() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector);
    let mut session = provider.connect(LiveConfig::default()).await.unwrap();
    let mut server = next_server(&mut links).await;
    server.push_json(&json!({"type": "session.created", "session": {}}));
    server.recv().await;
    server.push_json(&json!({"type": "session.updated", "session": {}}));

    server.push_json(&json!({
        "type": "error",
        "error": {"type": "invalid_request_error", "code": "bad_audio", "message": "bad audio"}
    }));
    server.push_json(&json!({"type": "input_audio_buffer.speech_started"}));

    let mut saw_api_error = false;
    loop {
        match next_item(&mut session).await.unwrap() {
            Err(Error::Api { provider, error }) => {
                assert_eq!(provider, "openai");
                assert_eq!(error.code.as_deref(), Some("bad_audio"));
                saw_api_error = true;
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(event) if event.kind() == EventKind::SpeechStarted => break,
            Ok(_) => {}
        }
    }
    assert!(saw_api_error);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector);
    let mut session = provider.connect(LiveConfig::default()).await.unwrap();
    let _server = next_server(&mut links).await;
    let mut transitions = session.subscribe_transitions();

    session.close().await;
    session.close().await;
    session.handle().close().await;

    let items = drain(&mut session).await;
    assert_eq!(states(&items), vec!["connected", "closed"]);
    let ended = items.last().unwrap().as_ref().unwrap();
    assert_eq!(ended.kind(), EventKind::SessionEnded);
    assert_eq!(ended.metadata(keys::SESSION_ENDED_REASON), Some("closed by client"));

    let transition = transitions.recv().await.unwrap();
    assert_eq!(transition.previous_state, ConnectionState::Connected);
    assert_eq!(transition.current_state, ConnectionState::Closed);
    assert!(matches!(
        session.send_text("after close").await,
        Err(Error::Transport(TransportError::NotSendable(ConnectionState::Closed)))
    ));
}

#[tokio::test(start_paused = true)]
async fn openai_reconnects_and_replays_handshake() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector.clone());
    let config = LiveConfig::builder().reconnect(fast_policy(3)).build().unwrap();
    let mut session = provider.connect(config).await.unwrap();

    let mut server = next_server(&mut links).await;
    server.push_json(&json!({"type": "session.created", "session": {}}));
    server.recv().await;
    server.push_json(&json!({"type": "session.updated", "session": {}}));
    drop(server);

    let reconnecting = next_event(&mut session).await;
    assert_eq!(reconnecting.kind(), EventKind::Reconnecting);
    assert_eq!(reconnecting.metadata(keys::CONNECTION_ATTEMPT), Some("1"));
    assert_eq!(reconnecting.metadata(keys::CONNECTION_MAX_ATTEMPTS), Some("3"));

    let mut server = next_server(&mut links).await;
    server.push_json(&json!({"type": "session.created", "session": {}}));
    assert_eq!(server.recv_json().await["type"], "session.update");
    server.push_json(&json!({"type": "session.updated", "session": {}}));

    assert_eq!(next_event(&mut session).await.kind(), EventKind::Reconnected);
    assert_eq!(session.state(), ConnectionState::Recovered);
    assert_eq!(connector.open_count(), 2);

    session.send_text("still here").await.unwrap();
    assert_eq!(server.recv_json().await["type"], "conversation.item.create");
    session.close().await;

    let items = drain(&mut session).await;
    assert_eq!(states(&items).last().map(String::as_str), Some("closed"));
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_end_in_failure() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector.clone());
    let config = LiveConfig::builder().reconnect(fast_policy(2)).build().unwrap();
    let mut session = provider.connect(config).await.unwrap();

    let mut server = next_server(&mut links).await;
    server.push_json(&json!({"type": "session.created", "session": {}}));
    server.recv().await;
    server.push_json(&json!({"type": "session.updated", "session": {}}));
    connector.refuse_next(5);
    drop(server);

    let items = drain(&mut session).await;
    assert_eq!(
        states(&items),
        vec!["connected", "disconnected", "reconnecting", "failed"]
    );
    let attempts: Vec<&str> = items
        .iter()
        .filter_map(|item| item.as_ref().ok())
        .filter(|event| event.kind() == EventKind::Reconnecting)
        .filter_map(|event| event.metadata(keys::CONNECTION_ATTEMPT))
        .collect();
    assert_eq!(attempts, vec!["1", "2"]);

    let failure = items
        .iter()
        .find_map(|item| item.as_ref().err())
        .expect("a terminal error");
    match failure {
        Error::ReconnectFailed(failed) => {
            assert_eq!(failed.attempt_count, 2);
            assert_eq!(failed.max_attempts, 2);
            assert!(failed.is_max_attempts_reached());
            assert!(failed.last_error.is_some());
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(
        items.last().unwrap().as_ref().unwrap().kind(),
        EventKind::SessionEnded
    );
    assert_eq!(connector.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn frames_from_a_released_link_are_dropped() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector.clone());
    let config = LiveConfig::builder().reconnect(fast_policy(3)).build().unwrap();
    let mut session = provider.connect(config).await.unwrap();

    let mut old = next_server(&mut links).await;
    old.push_json(&json!({"type": "session.created", "session": {}}));
    old.recv().await;
    old.push_json(&json!({"type": "session.updated", "session": {}}));

    // The reply to this frame fails, so the link is dropped with the next frame still queued.
    old.stop_reading();
    old.push_json(&json!({"type": "session.created", "session": {}}));
    old.push_json(&json!({"type": "response.text.delta", "delta": "stale"}));

    assert_eq!(next_event(&mut session).await.kind(), EventKind::Reconnecting);
    let mut server = next_server(&mut links).await;
    server.push_json(&json!({"type": "session.created", "session": {}}));
    server.recv().await;
    server.push_json(&json!({"type": "session.updated", "session": {}}));
    assert_eq!(next_event(&mut session).await.kind(), EventKind::Reconnected);

    server.push_json(&json!({"type": "response.text.delta", "delta": "fresh"}));
    let delta = next_event(&mut session).await;
    assert_eq!(delta.kind(), EventKind::TextDelta);
    assert_eq!(delta.message().unwrap().text(), "fresh");
    assert_eq!(connector.open_count(), 2);

    session.close().await;
    drop(old);
}

#[tokio::test(start_paused = true)]
async fn close_cancels_a_pending_reconnect() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector.clone());
    let policy = ReconnectPolicy::default()
        .with_max_attempts(3)
        .with_delays(Duration::from_secs(30), Duration::from_secs(60))
        .with_jitter(0.0);
    let config = LiveConfig::builder().reconnect(policy).build().unwrap();
    let mut session = provider.connect(config).await.unwrap();

    let mut server = next_server(&mut links).await;
    server.push_json(&json!({"type": "session.created", "session": {}}));
    server.recv().await;
    server.push_json(&json!({"type": "session.updated", "session": {}}));
    drop(server);

    assert_eq!(next_event(&mut session).await.kind(), EventKind::Reconnecting);
    session.close().await;

    let items = drain(&mut session).await;
    assert_eq!(states(&items), vec!["closed"]);
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test]
async fn close_completes_while_events_are_unread() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector);
    let session = provider.connect(LiveConfig::default()).await.unwrap();

    let mut server = next_server(&mut links).await;
    server.push_json(&json!({"type": "session.created", "session": {}}));
    server.recv().await;
    server.push_json(&json!({"type": "session.updated", "session": {}}));
    for _ in 0..600 {
        server.push_json(&json!({"type": "input_audio_buffer.speech_started"}));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closed = tokio::time::timeout(Duration::from_secs(2), session.close()).await;
    assert!(closed.is_ok());
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn disabled_reconnect_fails_on_first_loss() {
    let (connector, mut links) = MockConnector::new();
    let provider = OpenAiLiveProvider::new("sk", "m").unwrap().with_connector(connector.clone());
    let config = LiveConfig::builder().reconnect(ReconnectPolicy::disabled()).build().unwrap();
    let mut session = provider.connect(config).await.unwrap();

    let mut server = next_server(&mut links).await;
    server.push_json(&json!({"type": "session.created", "session": {}}));
    server.recv().await;
    server.push_json(&json!({"type": "session.updated", "session": {}}));
    server.break_link(TransportError::NotOpen.into());

    let items = drain(&mut session).await;
    assert_eq!(states(&items), vec!["connected", "failed"]);
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn gemini_resumes_with_latest_handle() {
    let (connector, mut links) = MockConnector::new();
    let provider = GeminiLiveProvider::new("g-key", "gemini-live")
        .unwrap()
        .with_connector(connector.clone());
    assert!(provider.supports_native_recovery());
    let config = LiveConfig::builder().reconnect(fast_policy(3)).build().unwrap();
    let mut session = provider.connect(config).await.unwrap();

    let mut server = next_server(&mut links).await;
    let setup = server.recv_json().await;
    assert_eq!(setup["setup"]["model"], "models/gemini-live");
    assert_eq!(setup["setup"]["sessionResumption"], json!({}));
    server.push_json(&json!({"setupComplete": {}}));
    server.push_json(&json!({"sessionResumptionUpdate": {"newHandle": "h-1", "resumable": true}}));
    server.push_json(&json!({"goAway": {"timeLeft": "2s"}}));

    let resumption = next_event(&mut session).await;
    assert_eq!(resumption.kind(), EventKind::SessionResumption);
    assert_eq!(resumption.metadata(keys::RESUMPTION_HANDLE), Some("h-1"));
    let go_away = next_event(&mut session).await;
    assert_eq!(go_away.metadata(keys::GO_AWAY_TIME_LEFT_MS), Some("2000"));
    drop(server);

    assert_eq!(next_event(&mut session).await.kind(), EventKind::Reconnecting);
    assert!(matches!(
        session.send_text("too early").await,
        Err(Error::Transport(TransportError::NotSendable(_)))
    ));

    let mut server = next_server(&mut links).await;
    let setup = server.recv_json().await;
    assert_eq!(setup["setup"]["sessionResumption"]["handle"], "h-1");
    assert_eq!(connector.request(1).header_value("x-goog-api-key"), Some("g-key"));
    server.push_json(&json!({"setupComplete": {}}));

    assert_eq!(next_event(&mut session).await.kind(), EventKind::Reconnected);
    assert_eq!(session.state(), ConnectionState::Recovered);
    session.close().await;
}

#[tokio::test]
async fn owned_stream_keeps_session_alive() {
    use futures::StreamExt;

    let (connector, mut links) = MockConnector::new();
    let provider = GeminiLiveProvider::new("g-key", "gemini-live")
        .unwrap()
        .with_connector(connector);
    let session = provider.connect(LiveConfig::default()).await.unwrap();
    let handle = session.handle();
    let mut stream = session.into_stream();

    let mut server = next_server(&mut links).await;
    server.recv().await;
    server.push_json(&json!({"setupComplete": {}}));
    server.push_json(&json!({"serverContent": {"modelTurn": {"parts": [{"text": "hey"}]}, "turnComplete": true}}));

    let mut kinds = Vec::new();
    while let Some(item) = stream.next().await {
        let event = item.unwrap();
        kinds.push(event.kind());
        if event.kind() == EventKind::TurnComplete {
            break;
        }
    }
    assert_eq!(
        kinds,
        vec![EventKind::ConnectionState, EventKind::TextDelta, EventKind::TurnComplete]
    );

    handle.close().await;
    let rest: Vec<_> = stream.collect().await;
    assert_eq!(
        rest.last().unwrap().as_ref().unwrap().kind(),
        EventKind::SessionEnded
    );
}
