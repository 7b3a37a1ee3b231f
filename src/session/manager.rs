//! Session supervisor loop.
//!
//! Connects through the transport, applies each lifecycle event to the
//! session state, and reconnects after retryable closes. A handle is always
//! closed and removed from the slot before the next connect is attempted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{
    HandleSlot, PairingArtifact, SessionError, SessionExit, SessionSnapshot, SessionState,
};
use crate::credentials::CredentialStore;
use crate::logging::targets;
use crate::router::InboundMessage;
use crate::transport::{
    ConnectConfig, Connection, ConnectionState, DisconnectReason, SessionHandle, Transport,
    TransportEvent,
};

/// Reconnect pacing.
///
/// The first reconnect after a close is immediate (transports routinely
/// close with "restart required" right after pairing). Later consecutive
/// attempts back off exponentially from `initial_delay` up to `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Give up after this many consecutive reconnect attempts.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Delay before the 1-based reconnect `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

impl From<&crate::config::ReconnectSection> for ReconnectPolicy {
    fn from(section: &crate::config::ReconnectSection) -> Self {
        Self {
            initial_delay: section.initial_delay,
            max_delay: section.max_delay,
            max_attempts: section.max_attempts,
        }
    }
}

enum Ended {
    Shutdown,
    Closed { code: Option<u16> },
}

/// Owns the session lifecycle. Consumed by [`SessionManager::run`], so at
/// most one supervisor loop exists per manager.
pub struct SessionManager {
    profile: String,
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    pairing: PairingArtifact,
    slot: HandleSlot,
    policy: ReconnectPolicy,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    status: watch::Sender<SessionSnapshot>,
    credentials: Option<Vec<u8>>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        pairing: PairingArtifact,
        slot: HandleSlot,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Self {
        let (status, _) = watch::channel(SessionSnapshot::default());
        Self {
            profile: "default".to_string(),
            transport,
            store,
            pairing,
            slot,
            policy: ReconnectPolicy::default(),
            inbound,
            status,
            credentials: None,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Receiver for state snapshots; stays valid after `run` consumes the manager.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.subscribe()
    }

    /// Supervise the session until logout, shutdown, or the attempt cap.
    ///
    /// Fails only when stored credentials cannot be loaded.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionExit, SessionError> {
        self.credentials = self.store.load(&self.profile).await?;
        if self.pairing.retire().await {
            debug!(target: targets::SESSION, "removed stale pairing artifact");
        }
        info!(
            target: targets::SESSION,
            profile = %self.profile,
            resuming = self.credentials.is_some(),
            "session supervisor starting"
        );

        let mut attempt: u32 = 0;
        let exit = loop {
            if *shutdown.borrow() {
                break SessionExit::Shutdown;
            }

            let code = match self.run_once(&mut shutdown, &mut attempt).await {
                Ended::Shutdown => break SessionExit::Shutdown,
                Ended::Closed { code } => code,
            };

            let reason = DisconnectReason::from_code(code);
            self.status.send_modify(|s| s.last_close_code = code);
            if reason.is_terminal() {
                self.set_state(SessionState::ClosedTerminal).await;
                warn!(
                    target: targets::SESSION,
                    "logged out remotely; run `wa-relay logout` to clear credentials, then restart to pair again"
                );
                break SessionExit::LoggedOut;
            }

            self.set_state(SessionState::ClosedRetryable).await;
            attempt += 1;
            self.status.send_modify(|s| s.reconnect_attempt = attempt);
            if !self.policy.allows(attempt) {
                error!(
                    target: targets::SESSION,
                    attempts = attempt - 1,
                    "giving up after repeated reconnect failures"
                );
                break SessionExit::GaveUp {
                    attempts: attempt - 1,
                };
            }

            let delay = self.policy.delay_for(attempt);
            info!(
                target: targets::SESSION,
                reason = %reason,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "disconnected, reconnecting"
            );
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break SessionExit::Shutdown,
                }
            }
        };

        if exit == SessionExit::Shutdown {
            self.set_state(SessionState::Cold).await;
        }
        info!(target: targets::SESSION, ?exit, "session supervisor stopped");
        Ok(exit)
    }

    /// One connect attempt and the life of the resulting handle.
    async fn run_once(&mut self, shutdown: &mut watch::Receiver<bool>, attempt: &mut u32) -> Ended {
        self.set_state(SessionState::Connecting).await;
        let config = ConnectConfig {
            profile: self.profile.clone(),
            credentials: self.credentials.clone(),
        };

        let connected = tokio::select! {
            result = self.transport.connect(config) => result,
            _ = wait_for_shutdown(shutdown) => return Ended::Shutdown,
        };
        let Connection { handle, mut events } = match connected {
            Ok(conn) => conn,
            Err(e) => {
                warn!(target: targets::SESSION, "connect failed: {}", e);
                return Ended::Closed { code: None };
            }
        };

        let handle_id = handle.id();
        self.slot.install(handle.clone());
        self.status.send_modify(|s| {
            s.handle_id = Some(handle_id);
            s.connects += 1;
        });
        debug!(target: targets::SESSION, handle = handle_id, "handle installed");

        let ended = loop {
            let event = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => break Ended::Shutdown,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                warn!(target: targets::SESSION, handle = handle_id, "event stream ended without close");
                break Ended::Closed { code: None };
            };
            if let Some(end) = self.dispatch(event, attempt).await {
                break end;
            }
        };

        // Nothing from this handle is acted on past this point.
        drop(events);
        self.retire_handle(handle).await;
        ended
    }

    /// Apply one event. Returns `Some` when the handle has closed.
    async fn dispatch(&mut self, event: TransportEvent, attempt: &mut u32) -> Option<Ended> {
        match event {
            TransportEvent::PairingToken(token) => {
                // A failed publish also removes the superseded code.
                match self.pairing.publish(&token).await {
                    Ok(()) => info!(
                        target: targets::SESSION,
                        path = %self.pairing.path().display(),
                        "pairing code ready, scan it to link this device"
                    ),
                    Err(e) => error!(target: targets::SESSION, "failed to publish pairing code: {}", e),
                }
                self.set_state(SessionState::Pairing).await;
                None
            }
            TransportEvent::Connection(update) => match update.state {
                ConnectionState::Connecting => {
                    self.set_state(SessionState::Connecting).await;
                    None
                }
                ConnectionState::Open => {
                    *attempt = 0;
                    self.status.send_modify(|s| s.reconnect_attempt = 0);
                    self.set_state(SessionState::Open).await;
                    info!(target: targets::SESSION, "connected");
                    None
                }
                ConnectionState::Close => Some(Ended::Closed {
                    code: update.close_code,
                }),
            },
            TransportEvent::CredentialsChanged(blob) => {
                self.persist_credentials(blob).await;
                None
            }
            TransportEvent::Message(raw) => {
                if let Some(message) = InboundMessage::from_raw(raw) {
                    if self.inbound.send(message).is_err() {
                        debug!(target: targets::SESSION, "router not running, message dropped");
                    }
                }
                None
            }
        }
    }

    async fn persist_credentials(&mut self, blob: Vec<u8>) {
        let blob = self.credentials.insert(blob);
        match self.store.save(&self.profile, blob).await {
            Ok(()) => debug!(target: targets::SESSION, bytes = blob.len(), "credentials persisted"),
            Err(e) => warn!(
                target: targets::SESSION,
                error = %e,
                "failed to persist credentials, will retry on next change"
            ),
        }
    }

    async fn retire_handle(&mut self, handle: Arc<dyn SessionHandle>) {
        self.pairing.retire().await;
        self.slot.clear();
        handle.close().await;
        self.status.send_modify(|s| s.handle_id = None);
        debug!(target: targets::SESSION, handle = handle.id(), "handle retired");
    }

    async fn set_state(&self, state: SessionState) {
        // The artifact only exists while pairing.
        if state != SessionState::Pairing {
            self.pairing.retire().await;
        }
        let previous = self.status.borrow().state;
        self.status.send_modify(|s| s.state = state);
        if previous != state {
            debug!(target: targets::SESSION, from = %previous, to = %state, "state transition");
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
