//! `/upload <url>` command: fetch a remote file and send it back as a document.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{CommandContext, CommandError, CommandHandler};
use crate::logging::targets;
use crate::media::{fetch_document, FileFetch};

pub const USAGE_NOTICE: &str = "📎 Please provide a file URL after `/upload`.";
pub const FAILURE_NOTICE: &str = "⚠️ Failed to fetch that file. Check the URL and try again.";

pub struct UploadCommand {
    fetcher: Arc<dyn FileFetch>,
}

impl UploadCommand {
    pub fn new(fetcher: Arc<dyn FileFetch>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl CommandHandler for UploadCommand {
    async fn handle(&self, ctx: &CommandContext, argument: &str) -> Result<(), CommandError> {
        if argument.is_empty() {
            return ctx.reply(USAGE_NOTICE).await;
        }

        let document = match fetch_document(self.fetcher.as_ref(), argument, None, None).await {
            Ok(document) => document,
            Err(e) => {
                warn!(target: targets::ROUTER, url = %argument, "upload fetch failed: {}", e);
                return ctx.reply(FAILURE_NOTICE).await;
            }
        };

        info!(
            target: targets::ROUTER,
            to = %ctx.sender_id,
            file_name = %document.meta.file_name,
            mimetype = %document.meta.mimetype,
            size = document.bytes.len(),
            "forwarding file"
        );
        let meta = document.meta;
        ctx.send_document(document.bytes, meta.file_name, meta.mimetype)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::*;
    use crate::media::{FetchError, FetchedFile};
    use crate::transport::OutboundContent;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct StubFetcher {
        response: Option<(&'static [u8], Option<&'static str>)>,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FileFetch for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError> {
            self.urls.lock().push(url.to_string());
            match self.response {
                Some((bytes, content_type)) => Ok(FetchedFile {
                    bytes: Bytes::from_static(bytes),
                    content_type: content_type.map(String::from),
                }),
                None => Err(FetchError::HttpStatus(404)),
            }
        }
    }

    #[tokio::test]
    async fn test_empty_url_replies_usage() {
        let (transport, ctx) = live_context().await;
        let fetcher = Arc::new(StubFetcher::default());
        UploadCommand::new(fetcher.clone()).handle(&ctx, "").await.unwrap();
        assert!(fetcher.urls.lock().is_empty());
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content.as_text(), Some(USAGE_NOTICE));
    }

    #[tokio::test]
    async fn test_fetch_failure_sends_notice_not_document() {
        let (transport, ctx) = live_context().await;
        let fetcher = Arc::new(StubFetcher::default());
        UploadCommand::new(fetcher)
            .handle(&ctx, "https://x.test/y.mp4")
            .await
            .unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].content.is_document());
        assert_eq!(sent[0].content.as_text(), Some(FAILURE_NOTICE));
    }

    #[tokio::test]
    async fn test_document_sent_with_inferred_name() {
        let (transport, ctx) = live_context().await;
        let fetcher = Arc::new(StubFetcher {
            response: Some((&b"\x00\x00\x00\x18ftypmp42"[..], Some("application/octet-stream"))),
            ..Default::default()
        });
        UploadCommand::new(fetcher.clone())
            .handle(&ctx, "https://x.test/clips/y.mp4")
            .await
            .unwrap();

        assert_eq!(*fetcher.urls.lock(), vec!["https://x.test/clips/y.mp4"]);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, SENDER);
        match &sent[0].content {
            OutboundContent::Document {
                bytes,
                file_name,
                mimetype,
            } => {
                assert_eq!(&bytes[..], b"\x00\x00\x00\x18ftypmp42");
                assert_eq!(file_name, "y.mp4");
                assert_eq!(mimetype, "video/mp4");
            }
            other => panic!("expected document, got {other:?}"),
        }
    }
}
