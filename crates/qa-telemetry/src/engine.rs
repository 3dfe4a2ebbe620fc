use crate::config::TelemetryConfig;
use crate::connection::{spawn_controller, ConnectionHandle, ControllerSettings};
use crate::error::{NormalizeError, TelemetryError};
use crate::event::TelemetryEvent;
use crate::normalize::normalize;
use crate::query::{self, TestFilter};
use crate::reducer::ReducerOptions;
use crate::retention::{run_cleanup, RetentionPolicy, RetentionScheduler};
use crate::state::{AgentRecord, Slice, TelemetryState, TestLogEntry, TestRecord};
use crate::store::TelemetryStore;
use crate::subscribers::{Listener, Subscription};
use crate::transport::{Transport, WebSocketTransport};
use chrono::Utc;
use qa_core::AgentStatus;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Lifecycle {
    Idle,
    Running {
        connection: ConnectionHandle,
        controller: JoinHandle<()>,
        retention: RetentionScheduler,
    },
    ShutDown,
}

/// The consumer-facing entry point: owns the store, the connection
/// controller and the retention scheduler.
///
/// Construct one per dashboard and pass it around; nothing here is global.
pub struct TelemetryEngine {
    config: TelemetryConfig,
    store: Arc<TelemetryStore>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for TelemetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = match &*self.lock_lifecycle() {
            Lifecycle::Idle => "idle",
            Lifecycle::Running { .. } => "running",
            Lifecycle::ShutDown => "shut_down",
        };
        f.debug_struct("TelemetryEngine")
            .field("url", &self.config.url)
            .field("lifecycle", &lifecycle)
            .finish()
    }
}

impl TelemetryEngine {
    pub fn new(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        config.validate()?;
        let store = Arc::new(TelemetryStore::new(ReducerOptions {
            max_notifications: config.max_notifications,
        }));
        Ok(Self {
            config,
            store,
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Spawns the connection controller over `transport` and the retention
    /// scheduler. Must be called from within a tokio runtime. Does not
    /// connect; call [`TelemetryEngine::connect`].
    pub fn start(&self, transport: Arc<dyn Transport>) -> Result<(), TelemetryError> {
        let mut lifecycle = self.lock_lifecycle();
        match &*lifecycle {
            Lifecycle::Running { .. } => return Err(TelemetryError::AlreadyStarted),
            Lifecycle::ShutDown => return Err(TelemetryError::ShutDown),
            Lifecycle::Idle => {}
        }
        let (connection, controller) = spawn_controller(
            Arc::clone(&self.store),
            transport,
            ControllerSettings::from_config(&self.config),
        );
        let retention = RetentionScheduler::start(
            Arc::clone(&self.store),
            RetentionPolicy::from_config(&self.config),
        );
        *lifecycle = Lifecycle::Running {
            connection,
            controller,
            retention,
        };
        info!(event = "telemetry_engine_started", url = %self.config.url);
        Ok(())
    }

    /// [`TelemetryEngine::start`] with a WebSocket transport to the
    /// configured endpoint.
    pub fn start_websocket(&self) -> Result<(), TelemetryError> {
        let transport = WebSocketTransport::new(self.config.endpoint()?, self.config.max_frame_bytes);
        debug!(event = "telemetry_transport_selected", url = %transport.url());
        self.start(Arc::new(transport))
    }

    /// Stops timers and the controller, closing any open session. Calling it
    /// again is a no-op.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lock_lifecycle(), Lifecycle::ShutDown);
        let Lifecycle::Running {
            connection,
            controller,
            mut retention,
        } = previous
        else {
            return;
        };
        retention.stop();
        if let Err(err) = connection.shutdown().await {
            debug!(event = "telemetry_shutdown_ack_missing", error = %err);
        }
        if let Err(err) = controller.await {
            warn!(event = "telemetry_controller_join_failed", error = %err);
        }
        info!(event = "telemetry_engine_stopped");
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lock_lifecycle(), Lifecycle::Running { .. })
    }

    pub async fn connect(&self) -> Result<(), TelemetryError> {
        self.connection()?.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), TelemetryError> {
        self.connection()?.disconnect().await
    }

    pub async fn reconnect(&self) -> Result<(), TelemetryError> {
        self.connection()?.reconnect().await
    }

    pub fn state(&self) -> Arc<TelemetryState> {
        self.store.snapshot()
    }

    pub fn subscribe(&self, listener: Listener) -> Subscription {
        self.store.subscribe(listener)
    }

    pub fn clear_test_logs(&self, test_id: &str) {
        self.store.apply(&TelemetryEvent::ClearTestLogs {
            test_id: test_id.to_string(),
        });
    }

    pub fn clear_all(&self) {
        self.store.apply(&TelemetryEvent::ClearAll);
    }

    /// Feeds one raw notification through the same pipeline as frames from
    /// the transport.
    pub fn ingest(&self, event: &str, payload: &Value) -> Result<Vec<Slice>, NormalizeError> {
        let received_at = Utc::now();
        let events = normalize(event, payload, received_at)?;
        Ok(self.store.apply_inbound(&events, received_at))
    }

    /// Runs one retention pass immediately.
    pub fn prune_now(&self) -> Vec<Slice> {
        run_cleanup(
            &self.store,
            &RetentionPolicy::from_config(&self.config),
            Utc::now(),
        )
    }

    pub fn agents_by_status(&self, status: AgentStatus) -> Vec<AgentRecord> {
        query::agents_by_status(&self.state(), status)
    }

    pub fn agents_by_type(&self, agent_type: &str) -> Vec<AgentRecord> {
        query::agents_by_type(&self.state(), agent_type)
    }

    pub fn agents_by_browser(&self, browser: &str) -> Vec<AgentRecord> {
        query::agents_by_browser(&self.state(), browser)
    }

    pub fn agents_by_health(&self, health: &str) -> Vec<AgentRecord> {
        query::agents_by_health(&self.state(), health)
    }

    pub fn find_agent(&self, agent_id: &str) -> Option<AgentRecord> {
        query::find_agent(&self.state(), agent_id)
    }

    pub fn filter_tests(&self, filter: &TestFilter) -> Vec<TestRecord> {
        query::filter_tests(&self.state(), filter)
    }

    pub fn running_tests(&self) -> Vec<TestRecord> {
        query::running_tests(&self.state())
    }

    pub fn test_logs(&self, test_id: &str) -> Vec<TestLogEntry> {
        query::test_logs(&self.state(), test_id)
    }

    fn connection(&self) -> Result<ConnectionHandle, TelemetryError> {
        match &*self.lock_lifecycle() {
            Lifecycle::Idle => Err(TelemetryError::NotInitialized),
            Lifecycle::Running { connection, .. } => Ok(connection.clone()),
            Lifecycle::ShutDown => Err(TelemetryError::ShutDown),
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
