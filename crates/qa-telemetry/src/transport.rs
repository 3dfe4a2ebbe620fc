//! Transport seam between the connection controller and the network.

use crate::error::TransportError;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use qa_core::telemetry_wire::{encode_frame, ClientEnvelope};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// The peer closed the stream. No frames follow.
    Closed { reason: String },
}

/// An open stream. Dropping `sender` asks the transport to close; the
/// receiver ends (or yields [`InboundFrame::Closed`]) when the stream is gone.
#[derive(Debug)]
pub struct TransportSession {
    pub sender: mpsc::Sender<ClientEnvelope>,
    pub receiver: mpsc::Receiver<InboundFrame>,
}

pub trait Transport: Send + Sync + 'static {
    fn open(&self) -> BoxFuture<'static, Result<TransportSession, TransportError>>;
}

/// Telemetry over a WebSocket, one JSON envelope per text frame.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
    max_frame_bytes: usize,
}

impl WebSocketTransport {
    pub fn new(url: Url, max_frame_bytes: usize) -> Self {
        Self {
            url,
            max_frame_bytes,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn open(&self) -> BoxFuture<'static, Result<TransportSession, TransportError>> {
        let url = self.url.clone();
        let max_frame_bytes = self.max_frame_bytes;
        Box::pin(async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            debug!(event = "ws_connected", url = %url);
            let (mut sink, mut stream) = ws.split();

            let (out_tx, mut out_rx) = mpsc::channel::<ClientEnvelope>(OUTBOUND_QUEUE);
            let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(INBOUND_QUEUE);

            tokio::spawn(async move {
                while let Some(envelope) = out_rx.recv().await {
                    let text = match encode_frame(&envelope, max_frame_bytes) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(event = "ws_encode_failed", error = %err);
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!(event = "ws_send_failed", error = %err);
                        break;
                    }
                }
                let _ = sink.close().await;
                debug!(event = "ws_writer_closed");
            });

            tokio::spawn(async move {
                let reason = loop {
                    let frame = match stream.next().await {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                debug!(event = "ws_binary_dropped");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|frame| frame.reason.to_string())
                                .filter(|reason| !reason.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => break err.to_string(),
                        None => break "stream ended".to_string(),
                    };
                    if in_tx.send(InboundFrame::Text(frame)).await.is_err() {
                        // Session dropped locally.
                        return;
                    }
                };
                let _ = in_tx.send(InboundFrame::Closed { reason }).await;
            });

            Ok(TransportSession {
                sender: out_tx,
                receiver: in_rx,
            })
        })
    }
}
