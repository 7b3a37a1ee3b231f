//! Session supervision.
//!
//! One [`SessionManager`] per process owns the lifecycle of the transport
//! session. Everything else reaches the live handle through the shared
//! [`HandleSlot`], which only the manager writes.

pub mod manager;
pub mod pairing;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::credentials::CredentialError;
use crate::transport::SessionHandle;

pub use manager::{ReconnectPolicy, SessionManager};
pub use pairing::{PairingArtifact, PairingError, PairingRenderer, SvgQrRenderer};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No handle yet, or the supervisor has stopped.
    #[default]
    Cold,
    /// Waiting for the user to scan the pairing artifact.
    Pairing,
    Connecting,
    Open,
    ClosedRetryable,
    /// Logged out remotely; no automatic reconnect.
    ClosedTerminal,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cold => "cold",
            Self::Pairing => "pairing",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::ClosedRetryable => "closed_retryable",
            Self::ClosedTerminal => "closed_terminal",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the session, published on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub handle_id: Option<u64>,
    pub last_close_code: Option<u16>,
    /// Consecutive reconnect attempts since the last successful open.
    pub reconnect_attempt: u32,
    pub connects: u64,
}

/// How the supervisor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Shutdown,
    LoggedOut,
    /// The reconnect policy's attempt cap was reached.
    GaveUp {
        attempts: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to load credentials: {0}")]
    CredentialLoad(#[from] CredentialError),
}

/// The single process-wide reference to the live session handle.
///
/// Readers clone the `Arc` out and release the lock immediately; the lock is
/// never held across an await.
#[derive(Clone, Default)]
pub struct HandleSlot {
    inner: Arc<RwLock<Option<Arc<dyn SessionHandle>>>>,
}

impl HandleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle active right now, if any.
    pub fn current(&self) -> Option<Arc<dyn SessionHandle>> {
        self.inner.read().clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().is_some()
    }

    pub fn current_id(&self) -> Option<u64> {
        self.inner.read().as_ref().map(|h| h.id())
    }

    pub(crate) fn install(&self, handle: Arc<dyn SessionHandle>) -> Option<Arc<dyn SessionHandle>> {
        self.inner.write().replace(handle)
    }

    pub(crate) fn clear(&self) -> Option<Arc<dyn SessionHandle>> {
        self.inner.write().take()
    }
}

impl fmt::Debug for HandleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleSlot")
            .field("handle", &self.current_id())
            .finish()
    }
}
