//! Live telemetry state for the QA dashboard.
//!
//! Raw notifications from the pulse stream are normalized into
//! [`TelemetryEvent`]s, folded into an immutable [`TelemetryState`] by pure
//! reducers, and fanned out to per-slice listeners. [`TelemetryEngine`] ties
//! the pieces together with a reconnecting transport and a retention timer.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod event;
pub mod normalize;
pub mod query;
pub mod reducer;
pub mod retention;
pub mod state;
pub mod store;
pub mod subscribers;
pub mod summary;
pub mod timer;
pub mod transport;

pub use config::TelemetryConfig;
pub use engine::TelemetryEngine;
pub use error::{ConfigError, NormalizeError, TelemetryError, TransportError};
pub use event::TelemetryEvent;
pub use query::TestFilter;
pub use state::{ConnectionStatus, Slice, TelemetryState};
pub use store::TelemetryStore;
pub use subscribers::{Listener, Subscription};
pub use transport::{InboundFrame, Transport, TransportSession, WebSocketTransport};
