//! WebSocket sidecar transport.
//!
//! The messaging-network client runs in a sidecar process; this adapter
//! speaks a small JSON frame protocol to it over one WebSocket per session.
//!
//! Outbound frames: `hello` (profile + base64 credentials), `send`.
//! Inbound frames: `qr`, `connection`, `creds`, `message`, `ack`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::{
    ConnectConfig, Connection, ConnectionState, ConnectionUpdate, OutboundContent, RawMessage,
    SendReceipt, SessionHandle, Transport, TransportError, TransportEvent,
};
use crate::logging::targets;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;
type PendingAcks = Arc<parking_lot::Mutex<HashMap<String, oneshot::Sender<AckFrame>>>>;

/// Default time to wait for the sidecar to acknowledge a send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_BUFFER: usize = 256;

// ============================================================================
// Wire frames
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutboundFrame<'a> {
    Hello {
        profile: &'a str,
        credentials: Option<String>,
        version: &'static str,
    },
    Send {
        id: &'a str,
        to: &'a str,
        content: WireContent<'a>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum WireContent<'a> {
    Text {
        text: &'a str,
    },
    Document {
        data: String,
        #[serde(rename = "fileName")]
        file_name: &'a str,
        mimetype: &'a str,
    },
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InboundFrame {
    Qr {
        token: String,
    },
    Connection {
        state: ConnectionState,
        #[serde(default, rename = "closeCode")]
        close_code: Option<u16>,
    },
    Creds {
        data: String,
    },
    Message {
        message: RawMessage,
    },
    Ack(AckFrame),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct AckFrame {
    id: String,
    ok: bool,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn encode_hello(config: &ConnectConfig) -> Result<String, TransportError> {
    let frame = OutboundFrame::Hello {
        profile: &config.profile,
        credentials: config.credentials.as_ref().map(|c| STANDARD.encode(c)),
        version: env!("CARGO_PKG_VERSION"),
    };
    serde_json::to_string(&frame).map_err(|e| TransportError::Protocol(e.to_string()))
}

fn encode_send(id: &str, to: &str, content: &OutboundContent) -> Result<String, TransportError> {
    let content = match content {
        OutboundContent::Text { text } => WireContent::Text { text },
        OutboundContent::Document {
            bytes,
            file_name,
            mimetype,
        } => WireContent::Document {
            data: STANDARD.encode(bytes),
            file_name,
            mimetype,
        },
    };
    serde_json::to_string(&OutboundFrame::Send { id, to, content })
        .map_err(|e| TransportError::Protocol(e.to_string()))
}

fn decode_frame(text: &str) -> Result<InboundFrame, TransportError> {
    serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Translate a non-ack frame into a transport event.
fn frame_to_event(frame: InboundFrame) -> Result<Option<TransportEvent>, TransportError> {
    Ok(Some(match frame {
        InboundFrame::Qr { token } => TransportEvent::PairingToken(token),
        InboundFrame::Connection { state, close_code } => {
            TransportEvent::Connection(ConnectionUpdate { state, close_code })
        }
        InboundFrame::Creds { data } => {
            let blob = STANDARD
                .decode(data.as_bytes())
                .map_err(|e| TransportError::Protocol(format!("invalid creds encoding: {e}")))?;
            TransportEvent::CredentialsChanged(blob)
        }
        InboundFrame::Message { message } => TransportEvent::Message(message),
        InboundFrame::Ack(_) => return Ok(None),
    }))
}

// ============================================================================
// Transport
// ============================================================================

/// [`Transport`] that connects to a sidecar over WebSocket.
pub struct BridgeTransport {
    url: String,
    send_timeout: Duration,
    next_id: AtomicU64,
}

impl BridgeTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&self, config: ConnectConfig) -> Result<Connection, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionError(format!("sidecar connect failed: {e}")))?;
        let (mut write, read) = ws_stream.split();

        write
            .send(Message::Text(encode_hello(&config)?))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("hello failed: {e}")))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let pending: PendingAcks = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let disconnected = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            id,
            read,
            events_tx,
            pending.clone(),
            disconnected.clone(),
        ));

        info!(target: targets::TRANSPORT, handle = id, url = %self.url, "sidecar session started");

        let handle = BridgeHandle {
            id,
            writer: Mutex::new(write),
            pending,
            closed: AtomicBool::new(false),
            disconnected,
            reader: parking_lot::Mutex::new(Some(reader)),
            send_timeout: self.send_timeout,
        };

        Ok(Connection {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

async fn read_loop(
    handle_id: u64,
    mut read: WsRead,
    events: mpsc::Sender<TransportEvent>,
    pending: PendingAcks,
    disconnected: Arc<AtomicBool>,
) {
    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(target: targets::TRANSPORT, handle = handle_id, "sidecar read failed: {}", e);
                break;
            }
        };

        let frame = match decode_frame(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(target: targets::TRANSPORT, handle = handle_id, "ignoring frame: {}", e);
                continue;
            }
        };

        if let InboundFrame::Ack(ack) = frame {
            if let Some(waiter) = pending.lock().remove(&ack.id) {
                let _ = waiter.send(ack);
            }
            continue;
        }

        match frame_to_event(frame) {
            Ok(Some(event)) => {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => debug!(target: targets::TRANSPORT, handle = handle_id, "ignoring frame: {}", e),
        }
    }

    // Outstanding sends will never be acknowledged now. The flag is set
    // before clearing so a send racing this exit still observes it.
    disconnected.store(true, Ordering::SeqCst);
    pending.lock().clear();
    debug!(target: targets::TRANSPORT, handle = handle_id, "sidecar read loop exited");
}

struct BridgeHandle {
    id: u64,
    writer: Mutex<WsWrite>,
    pending: PendingAcks,
    closed: AtomicBool,
    /// Set once the sidecar side of the socket is gone.
    disconnected: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    send_timeout: Duration,
}

#[async_trait]
impl SessionHandle for BridgeHandle {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send_message(
        &self,
        to: &str,
        content: OutboundContent,
    ) -> Result<SendReceipt, TransportError> {
        if self.is_gone() {
            return Err(TransportError::Closed);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = encode_send(&request_id, to, &content)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), ack_tx);
        if self.is_gone() {
            self.pending.lock().remove(&request_id);
            return Err(TransportError::Closed);
        }

        let write_result = self.writer.lock().await.send(Message::Text(frame)).await;
        if let Err(e) = write_result {
            self.pending.lock().remove(&request_id);
            return Err(match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
                _ if self.is_gone() => TransportError::Closed,
                e => TransportError::SendError(e.to_string()),
            });
        }

        match tokio::time::timeout(self.send_timeout, ack_rx).await {
            Ok(Ok(ack)) if ack.ok => Ok(SendReceipt {
                message_id: ack.message_id.unwrap_or(request_id),
            }),
            Ok(Ok(ack)) => Err(TransportError::SendError(
                ack.error.unwrap_or_else(|| "rejected by sidecar".to_string()),
            )),
            // The waiter is dropped only when the session goes away.
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(TransportError::Timeout("send acknowledgment"))
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.lock().clear();
        debug!(target: targets::TRANSPORT, handle = self.id, "sidecar session closed");
    }
}

impl BridgeHandle {
    fn is_gone(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.disconnected.load(Ordering::SeqCst)
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}
