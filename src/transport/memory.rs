//! In-process transport for tests (built with `cfg(test)` or the `test-util` feature).
//!
//! Every `connect` creates a [`MemorySession`] whose event sender is kept by
//! the transport, so a test can script pairing, open, close, and message
//! events and then inspect what was sent and how many handles were live.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{
    ConnectConfig, Connection, ConnectionUpdate, OutboundContent, RawMessage, SendReceipt,
    SessionHandle, Transport, TransportError, TransportEvent,
};

/// A send recorded by a memory handle.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub handle_id: u64,
    pub to: String,
    pub content: OutboundContent,
}

#[derive(Default)]
struct Shared {
    next_id: AtomicU64,
    live: AtomicUsize,
    max_live: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_sends: AtomicBool,
    sessions: Mutex<Vec<MemorySession>>,
    connect_configs: Mutex<Vec<ConnectConfig>>,
    sent: Mutex<Vec<SentMessage>>,
}

/// Scriptable in-memory [`Transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    connects_tx: Arc<watch::Sender<usize>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (connects_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared::default()),
            connects_tx: Arc::new(connects_tx),
        }
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make every send fail until switched back.
    pub fn fail_sends(&self, fail: bool) {
        self.shared.failing_sends.store(fail, Ordering::SeqCst);
    }

    /// Number of connect calls so far, including failed ones.
    pub fn connect_count(&self) -> usize {
        *self.connects_tx.borrow()
    }

    /// Handles created and not yet closed.
    pub fn live_handles(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live handles ever observed.
    pub fn max_live_handles(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }

    /// Credentials passed to each connect call, in order.
    pub fn connect_credentials(&self) -> Vec<Option<Vec<u8>>> {
        self.shared
            .connect_configs
            .lock()
            .iter()
            .map(|c| c.credentials.clone())
            .collect()
    }

    /// Session created by the `index`-th successful connect.
    pub fn session(&self, index: usize) -> Option<MemorySession> {
        self.shared.sessions.lock().get(index).cloned()
    }

    pub fn latest_session(&self) -> Option<MemorySession> {
        self.shared.sessions.lock().last().cloned()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.shared.sent.lock().clone()
    }

    /// Wait until at least `n` connect calls happened.
    pub async fn wait_for_connects(&self, n: usize, timeout: Duration) -> bool {
        let mut rx = self.connects_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count >= n))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Wait until at least `n` messages were sent.
    pub async fn wait_for_sent(&self, n: usize, timeout: Duration) -> Vec<SentMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sent = self.sent();
            if sent.len() >= n || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, config: ConnectConfig) -> Result<Connection, TransportError> {
        self.shared.connect_configs.lock().push(config);
        self.connects_tx.send_modify(|count| *count += 1);

        let failing = self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::ConnectionError(
                "injected connect failure".to_string(),
            ));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);
        let session = MemorySession {
            id,
            events: tx,
            closed: Arc::new(AtomicBool::new(false)),
            shared: self.shared.clone(),
        };
        self.shared.sessions.lock().push(session.clone());

        Ok(Connection {
            handle: Arc::new(session),
            events: rx,
        })
    }
}

/// One scripted session; doubles as its own [`SessionHandle`].
#[derive(Clone)]
pub struct MemorySession {
    id: u64,
    events: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl MemorySession {
    pub fn handle_id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push an event; returns false once the consumer has gone away.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub async fn emit_pairing(&self, token: &str) -> bool {
        self.emit(TransportEvent::PairingToken(token.to_string())).await
    }

    pub async fn emit_open(&self) -> bool {
        self.emit(TransportEvent::Connection(ConnectionUpdate::open()))
            .await
    }

    pub async fn emit_close(&self, code: Option<u16>) -> bool {
        self.emit(TransportEvent::Connection(ConnectionUpdate::close(code)))
            .await
    }

    pub async fn emit_credentials(&self, blob: &[u8]) -> bool {
        self.emit(TransportEvent::CredentialsChanged(blob.to_vec()))
            .await
    }

    pub async fn emit_message(&self, raw: RawMessage) -> bool {
        self.emit(TransportEvent::Message(raw)).await
    }
}

#[async_trait]
impl SessionHandle for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send_message(
        &self,
        to: &str,
        content: OutboundContent,
    ) -> Result<SendReceipt, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.shared.failing_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendError("injected send failure".to_string()));
        }
        let mut sent = self.shared.sent.lock();
        sent.push(SentMessage {
            handle_id: self.id,
            to: to.to_string(),
            content,
        });
        Ok(SendReceipt {
            message_id: format!("mem-{}-{}", self.id, sent.len()),
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
