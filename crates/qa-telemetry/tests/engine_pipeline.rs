use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future::BoxFuture;
use qa_core::telemetry_wire::{ClientEnvelope, ClientMsg};
use qa_core::{AgentStatus, TestStatus};
use qa_telemetry::state::NotificationKind;
use qa_telemetry::{
    ConnectionStatus, InboundFrame, Listener, TelemetryConfig, TelemetryEngine, TelemetryState,
    Transport, TransportError, TransportSession,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// The far side of one session opened through [`ChannelTransport`].
struct ServerEnd {
    from_client: mpsc::Receiver<ClientEnvelope>,
    to_client: mpsc::Sender<InboundFrame>,
}

impl ServerEnd {
    async fn send_event(&self, event: &str, payload: Value) {
        let frame = json!({ "event": event, "payload": payload }).to_string();
        self.send_raw(&frame).await;
    }

    async fn send_raw(&self, frame: &str) {
        self.to_client
            .send(InboundFrame::Text(frame.to_string()))
            .await
            .expect("client still listening");
    }

    async fn close(&self, reason: &str) {
        self.to_client
            .send(InboundFrame::Closed {
                reason: reason.to_string(),
            })
            .await
            .expect("client still listening");
    }

    async fn next_client_msg(&mut self) -> ClientMsg {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("client message in time")
            .expect("client channel open")
            .msg
    }
}

/// In-memory transport. Each `open` consumes one scripted outcome (success
/// when the script is empty) and hands the server end to the test.
struct ChannelTransport {
    script: Mutex<VecDeque<Result<(), String>>>,
    opened: mpsc::UnboundedSender<ServerEnd>,
    attempts: AtomicUsize,
}

impl ChannelTransport {
    fn new(script: Vec<Result<(), String>>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (opened, sessions) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                script: Mutex::new(script.into()),
                opened,
                attempts: AtomicUsize::new(0),
            }),
            sessions,
        )
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for ChannelTransport {
    fn open(&self) -> BoxFuture<'static, Result<TransportSession, TransportError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Ok(()));
        let opened = self.opened.clone();
        Box::pin(async move {
            outcome.map_err(TransportError::Connect)?;
            let (client_tx, from_client) = mpsc::channel(64);
            let (to_client, client_rx) = mpsc::channel(64);
            let _ = opened.send(ServerEnd {
                from_client,
                to_client,
            });
            Ok(TransportSession {
                sender: client_tx,
                receiver: client_rx,
            })
        })
    }
}

fn config() -> TelemetryConfig {
    TelemetryConfig {
        client_id: "pipeline-test".to_string(),
        ping_interval_ms: 600_000,
        max_reconnect_attempts: 3,
        initial_backoff_ms: 100,
        max_backoff_ms: 400,
        ..TelemetryConfig::default()
    }
}

async fn wait_until<F>(engine: &TelemetryEngine, what: &str, predicate: F)
where
    F: Fn(&TelemetryState) -> bool,
{
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if predicate(&engine.state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn next_session(sessions: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(5), sessions.recv())
        .await
        .expect("session opened in time")
        .expect("transport alive")
}

async fn connected_engine(
    config: TelemetryConfig,
) -> (TelemetryEngine, Arc<ChannelTransport>, mpsc::UnboundedReceiver<ServerEnd>, ServerEnd) {
    let engine = TelemetryEngine::new(config).expect("engine");
    let (transport, mut sessions) = ChannelTransport::new(Vec::new());
    engine.start(transport.clone()).expect("start");
    engine.connect().await.expect("connect");
    let mut server = next_session(&mut sessions).await;
    assert!(matches!(server.next_client_msg().await, ClientMsg::Hello(_)));
    assert!(matches!(server.next_client_msg().await, ClientMsg::Subscribe(_)));
    (engine, transport, sessions, server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_announces_and_subscribes() {
    let engine = TelemetryEngine::new(config()).expect("engine");
    let (transport, mut sessions) = ChannelTransport::new(Vec::new());
    assert!(!engine.is_running());
    engine.start(transport.clone()).expect("start");
    assert!(engine.is_running());
    assert_eq!(
        engine.start(transport.clone()),
        Err(qa_telemetry::TelemetryError::AlreadyStarted)
    );

    engine.connect().await.expect("connect");
    assert_eq!(engine.state().connection_status, ConnectionStatus::Connected);
    assert!(engine.state().stats.connected_since.is_some());

    let mut server = next_session(&mut sessions).await;
    match server.next_client_msg().await {
        ClientMsg::Hello(hello) => {
            assert_eq!(hello.client_id, "pipeline-test");
            assert!(hello.supports_compression);
        }
        other => panic!("expected hello, got {other:?}"),
    }
    match server.next_client_msg().await {
        ClientMsg::Subscribe(request) => {
            assert_eq!(request.channels, vec!["tests", "agents", "queue", "logs"]);
        }
        other => panic!("expected subscribe, got {other:?}"),
    }

    // Connecting again while connected opens nothing new.
    engine.connect().await.expect("connect again");
    assert_eq!(transport.attempts(), 1);
    engine.shutdown().await;
    assert!(!engine.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_scenario_over_the_wire() {
    let (engine, _transport, _sessions, server) = connected_engine(config()).await;

    server
        .send_event("test_started", json!({"id": "t1", "name": "Login", "totalSteps": 3}))
        .await;
    server
        .send_event("testLog", json!({"testId": "t1", "message": "step 2/3 running: click"}))
        .await;
    server
        .send_event("test:failed", json!({"id": "t1", "error": "timeout"}))
        .await;

    wait_until(&engine, "t1 to fail", |state| {
        state.test("t1").map(|t| t.status) == Some(TestStatus::Failed)
    })
    .await;
    let state = engine.state();
    let record = state.test("t1").expect("t1");
    assert_eq!(record.name, "Login");
    assert_eq!(record.current_step, 2);
    assert_eq!(record.total_steps, 3);
    assert_eq!(record.error.as_deref(), Some("timeout"));
    assert_eq!(state.step_for("t1").and_then(|s| s.description.as_deref()), Some("click"));
    assert_eq!(state.stats.messages_received, 3);
    assert!(state.stats.last_message_time.is_some());
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_are_dropped_without_side_effects() {
    let (engine, _transport, _sessions, server) = connected_engine(config()).await;

    server.send_raw("{\"event\": ").await;
    server.send_event("agent_status", json!({"status": "busy"})).await;
    server.send_event("wormhole_opened", json!({"id": "x"})).await;
    server.send_event("queue_status", json!({"pending": 4})).await;

    wait_until(&engine, "queue status", |state| state.queue_status.is_some()).await;
    let state = engine.state();
    assert!(state.agents.is_empty());
    assert_eq!(state.stats.messages_received, 1);
    assert_eq!(state.queue_status.as_ref().map(|q| q.pending), Some(4));
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_keeps_tests_and_reconnect_counts_once() {
    let (engine, transport, mut sessions, server) = connected_engine(config()).await;
    for id in ["t1", "t2", "t3"] {
        server.send_event("test_started", json!({"id": id})).await;
    }
    wait_until(&engine, "three running tests", |state| state.tests.len() == 3).await;
    let tests_before = Arc::clone(&engine.state().tests);

    engine.disconnect().await.expect("disconnect");
    let state = engine.state();
    assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
    assert!(state.stats.connected_since.is_none());
    assert_eq!(engine.running_tests().len(), 3);
    assert_eq!(
        state.notifications.last().map(|n| n.kind),
        Some(NotificationKind::Warning)
    );

    engine.connect().await.expect("connect");
    let _server = next_session(&mut sessions).await;
    let state = engine.state();
    assert_eq!(state.connection_status, ConnectionStatus::Connected);
    assert_eq!(state.stats.reconnect_count, 1);
    assert!(Arc::ptr_eq(&tests_before, &state.tests));
    assert_eq!(
        state.notifications.last().map(|n| n.kind),
        Some(NotificationKind::Success)
    );

    engine.reconnect().await.expect("reconnect");
    let _server = next_session(&mut sessions).await;
    assert_eq!(engine.state().stats.reconnect_count, 2);
    assert_eq!(transport.attempts(), 3);
    drop(server);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn server_close_triggers_automatic_reconnect() {
    let (engine, transport, mut sessions, server) = connected_engine(config()).await;
    server.send_event("test_started", json!({"id": "t1"})).await;
    wait_until(&engine, "t1", |state| state.test("t1").is_some()).await;

    server.close("server restart").await;
    let mut replacement = next_session(&mut sessions).await;
    assert!(matches!(replacement.next_client_msg().await, ClientMsg::Hello(_)));
    wait_until(&engine, "reconnected", |state| {
        state.connection_status == ConnectionStatus::Connected && state.stats.reconnect_count == 1
    })
    .await;

    let state = engine.state();
    assert!(state.test("t1").is_some());
    assert_eq!(transport.attempts(), 2);
    assert!(state
        .notifications
        .iter()
        .any(|n| n.kind == NotificationKind::Warning && n.message.contains("server restart")));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_surface_in_state_and_stop_at_the_limit() {
    let engine = TelemetryEngine::new(config()).expect("engine");
    let refused = || -> Result<(), String> { Err("connection refused".to_string()) };
    let (transport, _sessions) =
        ChannelTransport::new(vec![refused(), refused(), refused(), refused()]);
    engine.start(transport.clone()).expect("start");

    engine.connect().await.expect("connect returns even when the attempt fails");
    let state = engine.state();
    assert_eq!(state.connection_status, ConnectionStatus::Error);
    assert!(state
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("connection refused"));

    wait_until(&engine, "reconnect exhaustion", |state| {
        state
            .notifications
            .iter()
            .any(|n| n.message.contains("Gave up reconnecting after 3 attempts"))
    })
    .await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempts(), 4);
    assert_eq!(engine.state().connection_status, ConnectionStatus::Error);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn latency_probe_records_round_trip() {
    let (engine, _transport, _sessions, mut server) = connected_engine(TelemetryConfig {
        ping_interval_ms: 1_000,
        ..config()
    })
    .await;

    let probe = match server.next_client_msg().await {
        ClientMsg::Ping(probe) => probe,
        other => panic!("expected ping, got {other:?}"),
    };
    server
        .send_event("pong", json!({"timestamp_ms": probe.timestamp_ms}))
        .await;
    wait_until(&engine, "latency", |state| state.stats.latency_ms.is_some()).await;
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retention_runs_while_disconnected() {
    let engine = TelemetryEngine::new(TelemetryConfig {
        cleanup_interval_secs: 5,
        test_retention_secs: 3_600,
        ..config()
    })
    .expect("engine");
    let (transport, _sessions) = ChannelTransport::new(Vec::new());
    engine.start(transport).expect("start");

    let two_hours_ago = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
    for id in ["old", "young"] {
        engine
            .ingest("test_started", &json!({"id": id}))
            .expect("start test");
    }
    engine
        .ingest("test_completed", &json!({"id": "old", "timestamp": two_hours_ago}))
        .expect("finish old");
    engine
        .ingest("test_completed", &json!({"id": "young"}))
        .expect("finish young");

    tokio::time::sleep(Duration::from_secs(6)).await;
    let state = engine.state();
    assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
    assert!(state.test("old").is_none());
    assert!(state.logs_for("old").is_empty());
    assert!(state.test("young").is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn listeners_are_isolated_and_only_see_their_slices() {
    let engine = TelemetryEngine::new(config()).expect("engine");
    let test_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&test_calls);

    let _panicky = engine.subscribe(Listener::named("panicky").on_tests(|tests| {
        if !tests.is_empty() {
            panic!("dashboard widget bug");
        }
    }));
    let _tests_only = engine.subscribe(Listener::named("tests-only").on_tests(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(test_calls.load(Ordering::SeqCst), 1);

    engine
        .ingest("agentStatus", &json!({"agentId": "a1", "status": "busy"}))
        .expect("agent");
    assert_eq!(test_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.agents_by_status(AgentStatus::Busy).len(), 1);

    engine
        .ingest("test_started", &json!({"id": "t1"}))
        .expect("test");
    assert_eq!(test_calls.load(Ordering::SeqCst), 2);

    engine
        .ingest("test_started", &json!({"id": "t2"}))
        .expect("test");
    assert_eq!(test_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn performance_average_ignores_silent_agents() {
    let engine = TelemetryEngine::new(config()).expect("engine");
    engine
        .ingest("agent_performance", &json!({"agentId": "a1", "cpu": 70}))
        .expect("a1");
    engine
        .ingest("agent_performance", &json!({"agentId": "a2", "metrics": {"memoryUsage": 30}}))
        .expect("a2");

    let state = engine.state();
    assert_eq!(state.agent_performance.avg_cpu_usage, Some(70.0));
    assert_eq!(state.agent_performance.avg_memory_usage, Some(30.0));
    assert_eq!(state.agent_performance.reporting_agents, 2);
    assert_eq!(state.agent_status_summary.total, 2);
}
