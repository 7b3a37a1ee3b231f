//! Transport adapter seam.
//!
//! A [`Transport`] produces one [`Connection`] per connect attempt: a
//! [`SessionHandle`] for outbound sends plus the ordered stream of lifecycle,
//! credential, and message events for that handle.

pub mod bridge;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Close code the transport uses when the remote side revoked the session.
pub const LOGGED_OUT_CODE: u16 = 401;

/// Connection lifecycle state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub state: ConnectionState,
    /// Disconnect status code, present on `Close` when the transport knows it.
    pub close_code: Option<u16>,
}

impl ConnectionUpdate {
    pub fn open() -> Self {
        Self {
            state: ConnectionState::Open,
            close_code: None,
        }
    }

    pub fn close(code: Option<u16>) -> Self {
        Self {
            state: ConnectionState::Close,
            close_code: code,
        }
    }
}

/// Known disconnect reasons, keyed by the transport's status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionClosed,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionReplaced,
    LoggedOut,
    Forbidden,
    BadSession,
    Unavailable,
    RestartRequired,
    Unknown(Option<u16>),
}

impl DisconnectReason {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(428) => Self::ConnectionClosed,
            Some(408) => Self::ConnectionLost,
            Some(411) => Self::MultideviceMismatch,
            Some(440) => Self::ConnectionReplaced,
            Some(LOGGED_OUT_CODE) => Self::LoggedOut,
            Some(403) => Self::Forbidden,
            Some(500) => Self::BadSession,
            Some(503) => Self::Unavailable,
            Some(515) => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Self::ConnectionClosed => Some(428),
            Self::ConnectionLost => Some(408),
            Self::MultideviceMismatch => Some(411),
            Self::ConnectionReplaced => Some(440),
            Self::LoggedOut => Some(LOGGED_OUT_CODE),
            Self::Forbidden => Some(403),
            Self::BadSession => Some(500),
            Self::Unavailable => Some(503),
            Self::RestartRequired => Some(515),
            Self::Unknown(code) => *code,
        }
    }

    /// Only a logged-out close ends the session for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionLost => "connection lost",
            Self::MultideviceMismatch => "multidevice mismatch",
            Self::ConnectionReplaced => "connection replaced",
            Self::LoggedOut => "logged out",
            Self::Forbidden => "forbidden",
            Self::BadSession => "bad session",
            Self::Unavailable => "service unavailable",
            Self::RestartRequired => "restart required",
            Self::Unknown(Some(code)) => return write!(f, "unknown ({code})"),
            Self::Unknown(None) => "unknown",
        };
        f.write_str(label)
    }
}

/// How a batch of messages reached the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertKind {
    /// Newly received, live message
    #[default]
    Notify,
    /// History sync / catch-up
    Append,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: Option<String>,
}

/// Text-bearing parts of a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text: Option<String>,
    #[serde(default)]
    pub image_caption: Option<String>,
    #[serde(default)]
    pub video_caption: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            conversation: Some(text.into()),
            ..Default::default()
        }
    }

    /// First non-empty of: plain body, extended text, image caption, video
    /// caption. Empty string when none carries text.
    pub fn extract_text(&self) -> &str {
        [
            &self.conversation,
            &self.extended_text,
            &self.image_caption,
            &self.video_caption,
        ]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .find(|s| !s.is_empty())
        .unwrap_or("")
    }
}

/// A message as delivered by the transport, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default)]
    pub upsert: UpsertKind,
    pub key: MessageKey,
    /// Absent for protocol/stub messages without a body.
    #[serde(default)]
    pub message: Option<MessageContent>,
    #[serde(default)]
    pub push_name: Option<String>,
}

/// Events emitted by one connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PairingToken(String),
    Connection(ConnectionUpdate),
    CredentialsChanged(Vec<u8>),
    Message(RawMessage),
}

/// Outbound message body.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundContent {
    Text {
        text: String,
    },
    Document {
        bytes: Bytes,
        file_name: String,
        mimetype: String,
    },
}

impl OutboundContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Body of a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Document { .. } => None,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, Self::Document { .. })
    }
}

/// Acknowledgment for a delivered send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
}

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Session handle closed")]
    Closed,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Send error: {0}")]
    SendError(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// One live session with the messaging network.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Process-unique id, for logs and status.
    fn id(&self) -> u64;

    async fn send_message(
        &self,
        to: &str,
        content: OutboundContent,
    ) -> Result<SendReceipt, TransportError>;

    /// Tear down the session. Idempotent.
    async fn close(&self);
}

/// Parameters for a connect attempt.
#[derive(Debug, Clone, Default)]
pub struct ConnectConfig {
    pub profile: String,
    /// Previously persisted credentials; `None` starts first-time pairing.
    pub credentials: Option<Vec<u8>>,
}

/// Result of a successful connect.
pub struct Connection {
    pub handle: Arc<dyn SessionHandle>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle.id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: ConnectConfig) -> Result<Connection, TransportError>;
}

/// Normalize a recipient id to JID form.
///
/// Bare numbers (optionally `+`-prefixed) become user JIDs; numbers with the
/// group prefix become group JIDs; anything containing `@` passes through.
pub fn normalize_jid(id: &str) -> String {
    let trimmed = id.trim();

    if trimmed.contains('@') {
        return trimmed.to_string();
    }

    let digits: String = trimmed
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();

    if digits.starts_with("120363") {
        format!("{}@g.us", digits)
    } else {
        format!("{}@s.whatsapp.net", digits)
    }
}

/// Whether `id` can be normalized into an addressable JID.
pub fn is_valid_recipient(id: &str) -> bool {
    let jid = normalize_jid(id);
    match jid.split_once('@') {
        Some((user, server)) => !user.is_empty() && !server.is_empty() && !user.contains(' '),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_from_code() {
        assert_eq!(DisconnectReason::from_code(Some(401)), DisconnectReason::LoggedOut);
        assert_eq!(DisconnectReason::from_code(Some(515)), DisconnectReason::RestartRequired);
        assert_eq!(DisconnectReason::from_code(Some(428)), DisconnectReason::ConnectionClosed);
        assert_eq!(DisconnectReason::from_code(Some(999)), DisconnectReason::Unknown(Some(999)));
        assert_eq!(DisconnectReason::from_code(None), DisconnectReason::Unknown(None));
    }

    #[test]
    fn test_only_logged_out_is_terminal() {
        for code in [403, 408, 411, 428, 440, 500, 503, 515, 0, 999] {
            assert!(
                !DisconnectReason::from_code(Some(code)).is_terminal(),
                "code {code} should be retryable"
            );
        }
        assert!(!DisconnectReason::from_code(None).is_terminal());
        assert!(DisconnectReason::from_code(Some(LOGGED_OUT_CODE)).is_terminal());
    }

    #[test]
    fn test_disconnect_reason_code_round_trip() {
        for code in [401, 403, 408, 411, 428, 440, 500, 503, 515, 42] {
            assert_eq!(DisconnectReason::from_code(Some(code)).code(), Some(code));
        }
        assert_eq!(DisconnectReason::LoggedOut.to_string(), "logged out");
        assert_eq!(DisconnectReason::Unknown(Some(42)).to_string(), "unknown (42)");
    }

    #[test]
    fn test_extract_text_priority() {
        let content = MessageContent {
            conversation: None,
            extended_text: Some("extended".into()),
            image_caption: Some("caption".into()),
            video_caption: None,
        };
        assert_eq!(content.extract_text(), "extended");

        let content = MessageContent {
            conversation: Some(String::new()),
            extended_text: None,
            image_caption: None,
            video_caption: Some("video".into()),
        };
        assert_eq!(content.extract_text(), "video");

        assert_eq!(MessageContent::default().extract_text(), "");
        assert_eq!(MessageContent::text("hi").extract_text(), "hi");
    }

    #[test]
    fn test_raw_message_deserialize() {
        let json = r#"{
            "upsert": "notify",
            "key": {"remoteJid": "15551234567@s.whatsapp.net", "fromMe": false, "id": "ABC"},
            "message": {"imageCaption": "look"},
            "pushName": "Sam"
        }"#;
        let raw: RawMessage = serde_json::from_str(json).unwrap();
        assert_eq!(raw.upsert, UpsertKind::Notify);
        assert_eq!(raw.key.remote_jid, "15551234567@s.whatsapp.net");
        assert_eq!(raw.key.id.as_deref(), Some("ABC"));
        assert_eq!(raw.message.unwrap().extract_text(), "look");

        let minimal: RawMessage =
            serde_json::from_str(r#"{"upsert":"append","key":{"remoteJid":"x@g.us"}}"#).unwrap();
        assert_eq!(minimal.upsert, UpsertKind::Append);
        assert!(!minimal.key.from_me);
        assert!(minimal.message.is_none());
    }

    #[test]
    fn test_normalize_jid() {
        assert_eq!(normalize_jid("+1 555-123-4567"), "15551234567@s.whatsapp.net");
        assert_eq!(normalize_jid("15551234567"), "15551234567@s.whatsapp.net");
        assert_eq!(normalize_jid("120363012345678901"), "120363012345678901@g.us");
        assert_eq!(normalize_jid("  abc@g.us "), "abc@g.us");
    }

    #[test]
    fn test_is_valid_recipient() {
        assert!(is_valid_recipient("+15551234567"));
        assert!(is_valid_recipient("x@g.us"));
        assert!(!is_valid_recipient(""));
        assert!(!is_valid_recipient("+"));
        assert!(!is_valid_recipient("@s.whatsapp.net"));
    }
}
