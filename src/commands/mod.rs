//! Command handlers.
//!
//! Each handler receives the sender context and the classified argument, and
//! replies through whichever session handle is live when it sends.

pub mod ai;
pub mod upload;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::logging::targets;
use crate::session::HandleSlot;
use crate::transport::{OutboundContent, TransportError};

pub use ai::{AiCommand, CompletionError, CompletionService, OpenAiCompletionService};
pub use upload::UploadCommand;

/// Reply for messages that are not commands.
pub const ACKNOWLEDGMENT: &str =
    "👋 Got your message. Send `/ai <prompt>` to chat or `/upload <url>` to receive a file.";

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("reply failed: {0}")]
    Send(#[from] TransportError),

    #[error("{0}")]
    Handler(String),
}

/// Who to answer and how to reach the live session.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub sender_id: String,
    slot: HandleSlot,
}

impl CommandContext {
    pub fn new(sender_id: impl Into<String>, slot: HandleSlot) -> Self {
        Self {
            sender_id: sender_id.into(),
            slot,
        }
    }

    /// Send a text reply to the sender.
    pub async fn reply(&self, text: &str) -> Result<(), CommandError> {
        self.send(OutboundContent::text(text)).await
    }

    /// Send a document to the sender.
    pub async fn send_document(
        &self,
        bytes: Bytes,
        file_name: String,
        mimetype: String,
    ) -> Result<(), CommandError> {
        self.send(OutboundContent::Document {
            bytes,
            file_name,
            mimetype,
        })
        .await
    }

    /// Replies racing a disconnect are dropped; other send errors surface.
    async fn send(&self, content: OutboundContent) -> Result<(), CommandError> {
        let Some(handle) = self.slot.current() else {
            debug!(target: targets::ROUTER, to = %self.sender_id, "no active session, reply dropped");
            return Ok(());
        };
        match handle.send_message(&self.sender_id, content).await {
            Ok(_) => Ok(()),
            Err(TransportError::Closed | TransportError::NotConnected) => {
                debug!(
                    target: targets::ROUTER,
                    to = %self.sender_id,
                    handle = handle.id(),
                    "session closed mid-reply, reply dropped"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &CommandContext, argument: &str) -> Result<(), CommandError>;
}

/// Static acknowledgment for anything that is not a command.
#[derive(Debug, Default)]
pub struct AckCommand;

#[async_trait]
impl CommandHandler for AckCommand {
    async fn handle(&self, ctx: &CommandContext, _argument: &str) -> Result<(), CommandError> {
        ctx.reply(ACKNOWLEDGMENT).await
    }
}
