//! Connection lifecycle controller.
//!
//! One tokio task owns the transport session. Consumer commands, inbound
//! frames and reconnect timers are all handled by that task in arrival
//! order, which keeps state transitions for a connection strictly ordered.

use crate::config::TelemetryConfig;
use crate::error::{NormalizeError, TelemetryError};
use crate::event::{ConnectionEvent, TelemetryEvent};
use crate::normalize::normalize_envelope;
use crate::state::{ConnectionStatus, Slice};
use crate::store::TelemetryStore;
use crate::timer::IntervalTask;
use crate::transport::{InboundFrame, Transport, TransportSession};
use chrono::Utc;
use qa_core::telemetry_wire::{
    decode_frame, CapabilityAnnouncement, ClientEnvelope, ClientMsg, InboundEnvelope, PingPayload,
    ProtocolVersion, SubscribeRequest, TELEMETRY_CHANNELS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub client_id: String,
    pub client_name: String,
    pub client_version: String,
    pub supports_compression: bool,
    pub ping_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_frame_bytes: usize,
}

impl ControllerSettings {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_name: config.client_name.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            supports_compression: config.supports_compression,
            ping_interval: config.ping_interval(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

enum Command {
    Connect { ack: oneshot::Sender<()> },
    Disconnect { ack: oneshot::Sender<()> },
    Reconnect { ack: oneshot::Sender<()> },
    Shutdown { ack: oneshot::Sender<()> },
}

/// Cheap, cloneable handle for issuing commands to the controller task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    /// Resolves once the connection attempt has finished. A failed attempt
    /// is not an error here; it shows up in the state.
    pub async fn connect(&self) -> Result<(), TelemetryError> {
        self.request(|ack| Command::Connect { ack }).await
    }

    pub async fn disconnect(&self) -> Result<(), TelemetryError> {
        self.request(|ack| Command::Disconnect { ack }).await
    }

    pub async fn reconnect(&self) -> Result<(), TelemetryError> {
        self.request(|ack| Command::Reconnect { ack }).await
    }

    pub async fn shutdown(&self) -> Result<(), TelemetryError> {
        self.request(|ack| Command::Shutdown { ack }).await
    }

    async fn request<F>(&self, build: F) -> Result<(), TelemetryError>
    where
        F: FnOnce(oneshot::Sender<()>) -> Command,
    {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(build(ack))
            .await
            .map_err(|_| TelemetryError::ShutDown)?;
        done.await.map_err(|_| TelemetryError::ShutDown)
    }
}

pub fn spawn_controller(
    store: Arc<TelemetryStore>,
    transport: Arc<dyn Transport>,
    settings: ControllerSettings,
) -> (ConnectionHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
    let controller = Controller {
        backoff: settings.initial_backoff,
        store,
        transport,
        settings,
        session: None,
        ping: None,
        auto_reconnect: false,
        ever_connected: false,
        attempts: 0,
        retry_at: None,
    };
    let task = tokio::spawn(controller.run(commands_rx));
    (
        ConnectionHandle {
            commands: commands_tx,
        },
        task,
    )
}

struct Controller {
    store: Arc<TelemetryStore>,
    transport: Arc<dyn Transport>,
    settings: ControllerSettings,
    session: Option<TransportSession>,
    ping: Option<IntervalTask>,
    auto_reconnect: bool,
    ever_connected: bool,
    attempts: u32,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl Controller {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { ack }) => {
                        self.teardown();
                        let _ = ack.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown();
                        return;
                    }
                },
                frame = next_frame(&mut self.session) => self.handle_frame(frame),
                _ = wait_for_retry(self.retry_at) => {
                    self.retry_at = None;
                    info!(event = "telemetry_reconnect_attempt", attempt = self.attempts);
                    self.attempt_connect().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { ack } => {
                self.start_connect().await;
                let _ = ack.send(());
            }
            Command::Disconnect { ack } => {
                self.disconnect("disconnected by client");
                let _ = ack.send(());
            }
            Command::Reconnect { ack } => {
                self.disconnect("reconnect requested");
                self.start_connect().await;
                let _ = ack.send(());
            }
            Command::Shutdown { ack } => {
                self.teardown();
                let _ = ack.send(());
            }
        }
    }

    async fn start_connect(&mut self) {
        self.auto_reconnect = true;
        if self.session.is_some() {
            debug!(event = "telemetry_already_connected");
            return;
        }
        self.retry_at = None;
        self.attempts = 0;
        self.backoff = self.settings.initial_backoff;
        self.attempt_connect().await;
    }

    async fn attempt_connect(&mut self) {
        self.store
            .apply(&TelemetryEvent::Connection(ConnectionEvent::Connecting {
                at: Utc::now(),
            }));
        match self.transport.open().await {
            Ok(session) => self.on_open(session).await,
            Err(err) => self.on_failure(err.to_string()),
        }
    }

    async fn on_open(&mut self, session: TransportSession) {
        let handshake = [build_hello(&self.settings), build_subscribe(&self.settings)];
        for envelope in handshake {
            if session.sender.send(envelope).await.is_err() {
                self.on_failure("transport closed during handshake".to_string());
                return;
            }
        }

        let reconnect = self.ever_connected;
        self.ever_connected = true;
        self.attempts = 0;
        self.backoff = self.settings.initial_backoff;
        self.store
            .apply(&TelemetryEvent::Connection(ConnectionEvent::Connected {
                at: Utc::now(),
                reconnect,
            }));
        info!(event = "telemetry_connected", reconnect);
        self.start_ping(session.sender.clone());
        self.session = Some(session);
    }

    fn on_failure(&mut self, message: String) {
        self.stop_ping();
        self.session = None;
        warn!(event = "telemetry_connect_failed", error = %message, attempt = self.attempts);
        self.store
            .apply(&TelemetryEvent::Connection(ConnectionEvent::Failed {
                message,
                at: Utc::now(),
            }));
        self.schedule_retry();
    }

    fn on_dropped(&mut self, reason: String) {
        self.stop_ping();
        self.session = None;
        warn!(event = "telemetry_disconnected", reason = %reason);
        self.store
            .apply(&TelemetryEvent::Connection(ConnectionEvent::Disconnected {
                reason,
                at: Utc::now(),
            }));
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        let max_attempts = self.settings.max_reconnect_attempts;
        if !self.auto_reconnect || max_attempts == 0 {
            return;
        }
        if self.attempts >= max_attempts {
            self.auto_reconnect = false;
            warn!(event = "telemetry_reconnect_exhausted", attempts = self.attempts);
            self.store
                .apply(&TelemetryEvent::Connection(ConnectionEvent::ReconnectExhausted {
                    attempts: self.attempts,
                    at: Utc::now(),
                }));
            return;
        }
        self.attempts += 1;
        self.retry_at = Some(Instant::now() + self.backoff);
        debug!(
            event = "telemetry_reconnect_scheduled",
            attempt = self.attempts,
            delay_ms = self.backoff.as_millis() as u64
        );
        self.backoff = next_backoff(self.backoff, self.settings.max_backoff);
    }

    /// User-initiated disconnect. Turns automatic reconnection off.
    fn disconnect(&mut self, reason: &str) {
        self.auto_reconnect = false;
        self.retry_at = None;
        self.stop_ping();
        let had_session = self.session.take().is_some();
        let status = self.store.snapshot().connection_status;
        if had_session || status != ConnectionStatus::Disconnected {
            self.store
                .apply(&TelemetryEvent::Connection(ConnectionEvent::Disconnected {
                    reason: reason.to_string(),
                    at: Utc::now(),
                }));
        }
    }

    fn teardown(&mut self) {
        if self.session.is_some() {
            self.disconnect("engine shut down");
        } else {
            self.auto_reconnect = false;
            self.retry_at = None;
            self.stop_ping();
        }
        debug!(event = "telemetry_controller_stopped");
    }

    fn handle_frame(&mut self, frame: Option<InboundFrame>) {
        match frame {
            Some(InboundFrame::Text(text)) => {
                ingest_frame(&self.store, &text, self.settings.max_frame_bytes);
            }
            Some(InboundFrame::Closed { reason }) => self.on_dropped(reason),
            None => self.on_dropped("transport closed".to_string()),
        }
    }

    fn start_ping(&mut self, sender: mpsc::Sender<ClientEnvelope>) {
        self.stop_ping();
        let client_id = self.settings.client_id.clone();
        self.ping = Some(IntervalTask::spawn(
            "latency_ping",
            self.settings.ping_interval,
            move || {
                let sender = sender.clone();
                let probe = client_envelope(
                    &client_id,
                    ClientMsg::Ping(PingPayload {
                        timestamp_ms: Utc::now().timestamp_millis(),
                    }),
                );
                async move { sender.send(probe).await.is_ok() }
            },
        ));
    }

    fn stop_ping(&mut self) {
        if let Some(mut ping) = self.ping.take() {
            ping.stop();
        }
    }
}

async fn next_frame(session: &mut Option<TransportSession>) -> Option<InboundFrame> {
    match session {
        Some(session) => session.receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_for_retry(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Decodes, normalizes and applies one inbound text frame. Frames that fail
/// any step are dropped with a diagnostic and leave the state untouched.
pub fn ingest_frame(store: &TelemetryStore, text: &str, max_frame_bytes: usize) -> Vec<Slice> {
    let received_at = Utc::now();
    let envelope: InboundEnvelope = match decode_frame(text, max_frame_bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(event = "frame_dropped", error = %err);
            return Vec::new();
        }
    };
    match normalize_envelope(&envelope, received_at) {
        Ok(events) => store.apply_inbound(&events, received_at),
        Err(NormalizeError::Unrecognized(name)) => {
            debug!(event = "event_unrecognized", name = %name);
            Vec::new()
        }
        Err(err) => {
            warn!(event = "event_dropped", error = %err);
            Vec::new()
        }
    }
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

fn client_envelope(client_id: &str, msg: ClientMsg) -> ClientEnvelope {
    ClientEnvelope {
        version: ProtocolVersion::CURRENT,
        client_id: client_id.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        msg,
    }
}

pub fn build_hello(settings: &ControllerSettings) -> ClientEnvelope {
    client_envelope(
        &settings.client_id,
        ClientMsg::Hello(CapabilityAnnouncement {
            client_id: settings.client_id.clone(),
            client_name: settings.client_name.clone(),
            client_version: settings.client_version.clone(),
            supports_compression: settings.supports_compression,
            capabilities: vec!["latency_probe".to_string(), "log_step_markers".to_string()],
        }),
    )
}

pub fn build_subscribe(settings: &ControllerSettings) -> ClientEnvelope {
    client_envelope(
        &settings.client_id,
        ClientMsg::Subscribe(SubscribeRequest {
            channels: TELEMETRY_CHANNELS.iter().map(|c| c.to_string()).collect(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ControllerSettings {
        ControllerSettings::from_config(&TelemetryConfig {
            client_id: "monitor-1".to_string(),
            supports_compression: false,
            ..TelemetryConfig::default()
        })
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let max = Duration::from_secs(10);
        assert_eq!(next_backoff(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(4), max), Duration::from_secs(8));
        assert_eq!(next_backoff(Duration::from_secs(8), max), max);
        assert_eq!(next_backoff(max, max), max);
    }

    #[test]
    fn hello_announces_client_capabilities() {
        let hello = build_hello(&settings());
        assert_eq!(hello.client_id, "monitor-1");
        match hello.msg {
            ClientMsg::Hello(announcement) => {
                assert!(!announcement.supports_compression);
                assert_eq!(announcement.client_name, "qa-pulse");
                assert!(announcement.capabilities.contains(&"latency_probe".to_string()));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn subscribe_requests_every_channel() {
        match build_subscribe(&settings()).msg {
            ClientMsg::Subscribe(request) => {
                assert_eq!(request.channels, vec!["tests", "agents", "queue", "logs"]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_leave_state_untouched() {
        let store = TelemetryStore::default();
        let before = store.snapshot();
        assert!(ingest_frame(&store, "{not json", 1024).is_empty());
        assert!(ingest_frame(&store, r#"{"event":"test_started","payload":{}}"#, 1024).is_empty());
        assert!(ingest_frame(&store, r#"{"event":"mystery","payload":{"id":"x"}}"#, 1024).is_empty());
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[test]
    fn valid_frame_is_applied_and_counted() {
        let store = TelemetryStore::default();
        let changed = ingest_frame(
            &store,
            r#"{"event":"testStarted","payload":{"testId":"t1","testName":"Login"}}"#,
            1024,
        );
        assert!(changed.contains(&Slice::Tests));
        assert!(changed.contains(&Slice::Stats));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.test("t1").map(|t| t.name.as_str()), Some("Login"));
        assert_eq!(snapshot.stats.messages_received, 1);
    }

    #[test]
    fn hostile_pong_is_dropped_without_panicking() {
        let store = TelemetryStore::default();
        let before = store.snapshot();
        let frame = format!(r#"{{"event":"pong","payload":{{"timestamp_ms":{}}}}}"#, i64::MIN);
        assert!(ingest_frame(&store, &frame, 1024).is_empty());
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }
}
