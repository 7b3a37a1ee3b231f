//! Inbound message routing.
//!
//! Messages arrive from the session supervisor in transport order, are
//! classified by command prefix, and are dispatched one at a time to exactly
//! one handler. Handler errors and panics stop here and become a short
//! notice to the sender.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::commands::{CommandContext, CommandHandler};
use crate::logging::targets;
use crate::session::HandleSlot;
use crate::transport::{RawMessage, UpsertKind};

/// Sent to the user when a handler fails unexpectedly.
pub const FAILURE_NOTICE: &str = "⚠️ Something went wrong handling your message. Try again later.";

const AI_PREFIX: &str = "/ai";
const UPLOAD_PREFIX: &str = "/upload ";

/// Normalized inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender_id: String,
    pub raw_text: String,
    pub is_from_self: bool,
    pub message_id: Option<String>,
    pub push_name: Option<String>,
}

impl InboundMessage {
    /// Normalize a raw transport message.
    ///
    /// Returns `None` for history-sync batches, our own messages, and
    /// messages without any extractable text.
    pub fn from_raw(raw: RawMessage) -> Option<Self> {
        if raw.upsert != UpsertKind::Notify || raw.key.from_me {
            return None;
        }
        let content = raw.message?;
        let text = content.extract_text();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            sender_id: raw.key.remote_jid,
            raw_text: text.to_string(),
            is_from_self: false,
            message_id: raw.key.id,
            push_name: raw.push_name,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Ai,
    Upload,
    Default,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Ai => "ai",
            Verb::Upload => "upload",
            Verb::Default => "default",
        }
    }
}

/// A classified message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub argument: String,
}

/// Classify message text. Total: every input maps to exactly one verb.
///
/// - `/ai...` → `Ai`, argument is the rest of the text, trimmed
/// - `/upload <url> ...` → `Upload`, argument is the first token after the prefix
/// - anything else → `Default`, argument is the text unchanged
pub fn classify(text: &str) -> Command {
    if let Some(rest) = text.strip_prefix(AI_PREFIX) {
        return Command {
            verb: Verb::Ai,
            argument: rest.trim().to_string(),
        };
    }
    if let Some(rest) = text.strip_prefix(UPLOAD_PREFIX) {
        return Command {
            verb: Verb::Upload,
            argument: rest.split_whitespace().next().unwrap_or("").to_string(),
        };
    }
    Command {
        verb: Verb::Default,
        argument: text.to_string(),
    }
}

/// One handler per verb.
#[derive(Clone)]
pub struct CommandRegistry {
    pub ai: Arc<dyn CommandHandler>,
    pub upload: Arc<dyn CommandHandler>,
    pub fallback: Arc<dyn CommandHandler>,
}

impl CommandRegistry {
    pub fn handler_for(&self, verb: Verb) -> &Arc<dyn CommandHandler> {
        match verb {
            Verb::Ai => &self.ai,
            Verb::Upload => &self.upload,
            Verb::Default => &self.fallback,
        }
    }
}

/// Dispatches inbound messages to command handlers.
#[derive(Clone)]
pub struct MessageRouter {
    registry: CommandRegistry,
    slot: HandleSlot,
}

impl MessageRouter {
    pub fn new(registry: CommandRegistry, slot: HandleSlot) -> Self {
        Self { registry, slot }
    }

    /// Route a single message. Never fails: handler errors and panics turn
    /// into a best-effort failure notice to the sender.
    pub async fn route(&self, message: &InboundMessage) {
        let command = classify(&message.raw_text);
        let ctx = CommandContext::new(message.sender_id.clone(), self.slot.clone());
        let handler = self.registry.handler_for(command.verb);

        debug!(
            target: targets::ROUTER,
            sender = %message.sender_id,
            verb = command.verb.as_str(),
            "dispatching message"
        );

        let outcome = AssertUnwindSafe(handler.handle(&ctx, &command.argument))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        error!(
            target: targets::ROUTER,
            sender = %message.sender_id,
            verb = command.verb.as_str(),
            "handler failed: {}",
            failure
        );
        if let Err(e) = ctx.reply(FAILURE_NOTICE).await {
            warn!(target: targets::ROUTER, "failed to deliver failure notice: {}", e);
        }
    }

    /// Process messages in arrival order until the channel closes or
    /// shutdown is signalled.
    pub async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(target: targets::ROUTER, "message router started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = inbound.recv() => {
                    let Some(message) = message else { break };
                    self.route(&message).await;
                }
            }
        }
        info!(target: targets::ROUTER, "message router stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandError;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{ConnectConfig, MessageContent, MessageKey, Transport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_classify_ai() {
        assert_eq!(
            classify("/ai   tell me a joke"),
            Command {
                verb: Verb::Ai,
                argument: "tell me a joke".into()
            }
        );
        assert_eq!(classify("/ai").argument, "");
        assert_eq!(classify("/ai   ").verb, Verb::Ai);
        // Prefix match only, no word boundary.
        assert_eq!(classify("/aircraft").argument, "rcraft");
    }

    #[test]
    fn test_classify_upload() {
        assert_eq!(
            classify("/upload https://x/y.mp4"),
            Command {
                verb: Verb::Upload,
                argument: "https://x/y.mp4".into()
            }
        );
        assert_eq!(classify("/upload  https://a/b c d").argument, "https://a/b");
        assert_eq!(classify("/upload ").argument, "");
        // Without the trailing space this is not an upload.
        assert_eq!(classify("/upload").verb, Verb::Default);
    }

    #[test]
    fn test_classify_default() {
        assert_eq!(
            classify(""),
            Command {
                verb: Verb::Default,
                argument: String::new()
            }
        );
        assert_eq!(classify("hello /ai").verb, Verb::Default);
        assert_eq!(classify(" /ai x").verb, Verb::Default);
        assert_eq!(classify("hi there").argument, "hi there");
    }

    fn raw(text: Option<&str>) -> RawMessage {
        RawMessage {
            upsert: UpsertKind::Notify,
            key: MessageKey {
                remote_jid: "15550001111@s.whatsapp.net".into(),
                from_me: false,
                id: Some("ABC".into()),
            },
            message: text.map(MessageContent::text),
            push_name: Some("Sam".into()),
        }
    }

    #[test]
    fn test_from_raw_filters() {
        let msg = InboundMessage::from_raw(raw(Some("hi"))).unwrap();
        assert_eq!(msg.sender_id, "15550001111@s.whatsapp.net");
        assert_eq!(msg.raw_text, "hi");
        assert!(!msg.is_from_self);
        assert_eq!(msg.message_id.as_deref(), Some("ABC"));

        assert!(InboundMessage::from_raw(raw(None)).is_none());
        assert!(InboundMessage::from_raw(raw(Some(""))).is_none());

        let mut own = raw(Some("hi"));
        own.key.from_me = true;
        assert!(InboundMessage::from_raw(own).is_none());

        let mut history = raw(Some("hi"));
        history.upsert = UpsertKind::Append;
        assert!(InboundMessage::from_raw(history).is_none());
    }

    #[test]
    fn test_from_raw_uses_caption() {
        let mut msg = raw(None);
        msg.message = Some(MessageContent {
            image_caption: Some("look".into()),
            ..Default::default()
        });
        assert_eq!(InboundMessage::from_raw(msg).unwrap().raw_text, "look");
    }

    /// Records every argument it is called with.
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandHandler for Recording {
        async fn handle(&self, ctx: &CommandContext, argument: &str) -> Result<(), CommandError> {
            self.calls.lock().push(argument.to_string());
            ctx.reply(&format!("echo {argument}")).await
        }
    }

    struct Failing;

    #[async_trait]
    impl CommandHandler for Failing {
        async fn handle(&self, _: &CommandContext, _: &str) -> Result<(), CommandError> {
            Err(CommandError::Handler("boom".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl CommandHandler for Panicking {
        async fn handle(&self, _: &CommandContext, _: &str) -> Result<(), CommandError> {
            panic!("handler exploded");
        }
    }

    async fn connected_slot() -> (MemoryTransport, HandleSlot) {
        let transport = MemoryTransport::new();
        let conn = transport.connect(ConnectConfig::default()).await.unwrap();
        let slot = HandleSlot::new();
        slot.install(conn.handle);
        (transport, slot)
    }

    fn message(text: &str) -> InboundMessage {
        InboundMessage {
            sender_id: "15550001111@s.whatsapp.net".into(),
            raw_text: text.into(),
            is_from_self: false,
            message_id: None,
            push_name: None,
        }
    }

    #[tokio::test]
    async fn test_route_dispatches_to_exactly_one_handler() {
        let (transport, slot) = connected_slot().await;
        let ai = Arc::new(Recording::default());
        let upload = Arc::new(Recording::default());
        let fallback = Arc::new(Recording::default());
        let router = MessageRouter::new(
            CommandRegistry {
                ai: ai.clone(),
                upload: upload.clone(),
                fallback: fallback.clone(),
            },
            slot,
        );

        router.route(&message("/ai hello")).await;
        router.route(&message("/upload https://x/y.pdf")).await;
        router.route(&message("plain")).await;

        assert_eq!(*ai.calls.lock(), vec!["hello"]);
        assert_eq!(*upload.calls.lock(), vec!["https://x/y.pdf"]);
        assert_eq!(*fallback.calls.lock(), vec!["plain"]);
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure_notice() {
        let (transport, slot) = connected_slot().await;
        let router = MessageRouter::new(
            CommandRegistry {
                ai: Arc::new(Failing),
                upload: Arc::new(Panicking),
                fallback: Arc::new(Recording::default()),
            },
            slot,
        );

        router.route(&message("/ai x")).await;
        router.route(&message("/upload https://x")).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        for msg in sent {
            assert_eq!(msg.to, "15550001111@s.whatsapp.net");
            assert_eq!(msg.content.as_text(), Some(FAILURE_NOTICE));
        }
    }

    #[tokio::test]
    async fn test_route_without_handle_is_silent() {
        let router = MessageRouter::new(
            CommandRegistry {
                ai: Arc::new(Failing),
                upload: Arc::new(Recording::default()),
                fallback: Arc::new(Recording::default()),
            },
            HandleSlot::new(),
        );
        router.route(&message("hello")).await;
        router.route(&message("/ai x")).await;
    }

    #[tokio::test]
    async fn test_run_processes_in_order_and_stops() {
        let (transport, slot) = connected_slot().await;
        let fallback = Arc::new(Recording::default());
        let router = MessageRouter::new(
            CommandRegistry {
                ai: Arc::new(Recording::default()),
                upload: Arc::new(Recording::default()),
                fallback: fallback.clone(),
            },
            slot,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(router.run(rx, shutdown_rx));

        for i in 0..5 {
            tx.send(message(&format!("m{i}"))).unwrap();
        }
        let sent = transport.wait_for_sent(5, Duration::from_secs(2)).await;
        let texts: Vec<_> = sent.iter().filter_map(|m| m.content.as_text()).collect();
        assert_eq!(texts, vec!["echo m0", "echo m1", "echo m2", "echo m3", "echo m4"]);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fallback.calls.lock().len(), 5);
    }
}
