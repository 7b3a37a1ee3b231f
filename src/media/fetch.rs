//! Remote file fetch for uploads.
//!
//! - HTTP/HTTPS only
//! - URL length cap
//! - Loopback, private, and link-local literal hosts rejected unless allowed,
//!   including on every redirect hop
//! - Response body streamed with a size limit

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use url::{Host, Url};

use crate::logging::targets;

/// Maximum URL length (2KB)
pub const MAX_URL_LENGTH: usize = 2048;

/// Default fetch timeout in milliseconds (30s)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Maximum fetch timeout in milliseconds (5 minutes)
pub const MAX_FETCH_TIMEOUT_MS: u64 = 300_000;

/// Default maximum response size (64MB)
pub const DEFAULT_MAX_SIZE: u64 = 64 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("URL too long: {size} chars (max {max})")]
    UrlTooLong { size: usize, max: usize },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Blocked host: {0}")]
    BlockedHost(String),

    #[error("HTTP request failed: {0}")]
    HttpRequest(String),

    #[error("Server responded with status {0}")]
    HttpStatus(u16),

    #[error("Response too large: {size} bytes (max {max})")]
    ResponseTooLarge { size: u64, max: u64 },

    #[error("Stream read error: {0}")]
    StreamRead(String),
}

/// A fetched remote file.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Bytes,
    /// Content-Type from response headers, if present
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_size: u64,
    pub timeout_ms: u64,
    /// Permit loopback/private literal hosts (local development, tests).
    pub allow_private_hosts: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            allow_private_hosts: false,
        }
    }
}

impl FetchConfig {
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms.min(MAX_FETCH_TIMEOUT_MS);
        self
    }

    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }
}

impl From<&crate::config::UploadSection> for FetchConfig {
    fn from(section: &crate::config::UploadSection) -> Self {
        let config = FetchConfig {
            max_size: section.max_bytes,
            allow_private_hosts: section.allow_private_hosts,
            ..Default::default()
        };
        config.with_timeout_ms(section.timeout.as_millis() as u64)
    }
}

/// Fetches a remote resource by URL.
#[async_trait]
pub trait FileFetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError>;
}

/// reqwest-backed [`FileFetch`].
pub struct HttpFileFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpFileFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let allow_private = config.allow_private_hosts;
        let redirect = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if check_host(attempt.url(), allow_private).is_err() {
                attempt.error("redirect to blocked host")
            } else {
                attempt.follow()
            }
        });
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_millis(config.timeout_ms))
            .redirect(redirect)
            .build()
            .map_err(|e| FetchError::HttpRequest(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    async fn read_with_limit(
        &self,
        response: reqwest::Response,
        max_size: u64,
    ) -> Result<Bytes, FetchError> {
        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| FetchError::StreamRead(format!("Failed to read chunk: {}", e)))?;
            let new_size = body.len() as u64 + chunk.len() as u64;
            if new_size > max_size {
                return Err(FetchError::ResponseTooLarge {
                    size: new_size,
                    max: max_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}

#[async_trait]
impl FileFetch for HttpFileFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError> {
        let parsed = validate_url(url, self.config.allow_private_hosts)?;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| FetchError::HttpRequest(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        if let Some(content_length) = response.content_length() {
            if content_length > self.config.max_size {
                return Err(FetchError::ResponseTooLarge {
                    size: content_length,
                    max: self.config.max_size,
                });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = self.read_with_limit(response, self.config.max_size).await?;
        tracing::debug!(
            target: targets::HTTP,
            url = %url,
            size = bytes.len(),
            content_type = content_type.as_deref().unwrap_or("-"),
            "fetched remote file"
        );

        Ok(FetchedFile {
            bytes,
            content_type,
        })
    }
}

/// Validate a fetch URL: length, scheme, and host policy.
pub fn validate_url(url: &str, allow_private: bool) -> Result<Url, FetchError> {
    if url.len() > MAX_URL_LENGTH {
        return Err(FetchError::UrlTooLong {
            size: url.len(),
            max: MAX_URL_LENGTH,
        });
    }
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(FetchError::InvalidUrl(format!(
                "only http and https URLs can be fetched, got '{}'",
                other
            )))
        }
    }
    check_host(&parsed, allow_private)?;
    Ok(parsed)
}

fn check_host(url: &Url, allow_private: bool) -> Result<(), FetchError> {
    let host = url
        .host()
        .ok_or_else(|| FetchError::InvalidUrl("URL has no host".to_string()))?;
    if allow_private {
        return Ok(());
    }
    let blocked = match &host {
        Host::Domain(name) => {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            name == "localhost" || name.ends_with(".localhost")
        }
        Host::Ipv4(ip) => is_private_ip(&IpAddr::V4(*ip)),
        Host::Ipv6(ip) => is_private_ip(&IpAddr::V6(*ip)),
    };
    if blocked {
        return Err(FetchError::BlockedHost(host.to_string()));
    }
    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    #[test]
    fn test_fetch_config_defaults() {
        let config = FetchConfig::default();
        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.timeout_ms, DEFAULT_FETCH_TIMEOUT_MS);
        assert!(!config.allow_private_hosts);
    }

    #[test]
    fn test_fetch_config_timeout_capped() {
        let config = FetchConfig::default().with_timeout_ms(MAX_FETCH_TIMEOUT_MS + 100_000);
        assert_eq!(config.timeout_ms, MAX_FETCH_TIMEOUT_MS);
    }

    #[test]
    fn test_validate_url_rules() {
        assert!(validate_url("https://example.com/a.pdf", false).is_ok());
        assert!(validate_url("http://example.com/a.pdf", false).is_ok());
        assert!(matches!(
            validate_url("ftp://example.com/file", false),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("file:///etc/passwd", false),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("not a url", false),
            Err(FetchError::InvalidUrl(_))
        ));
        let long_url = format!("https://example.com/{}", "x".repeat(MAX_URL_LENGTH));
        assert!(matches!(
            validate_url(&long_url, false),
            Err(FetchError::UrlTooLong { .. })
        ));
    }

    #[test]
    fn test_validate_url_blocks_private_hosts() {
        for url in [
            "http://localhost/a",
            "http://127.0.0.1/a",
            "http://10.0.0.1/a",
            "http://172.16.0.1/a",
            "http://192.168.1.1/a",
            "http://169.254.169.254/latest/meta-data/",
            "http://100.100.50.25/a",
            "http://[::1]/a",
            "http://[fc00::1]/a",
            "http://[fe80::1]/a",
            "http://[::ffff:127.0.0.1]/a",
        ] {
            assert!(
                matches!(validate_url(url, false), Err(FetchError::BlockedHost(_))),
                "{url} should be blocked"
            );
            assert!(validate_url(url, true).is_ok(), "{url} should be allowed");
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_router() -> Router {
        Router::new()
            .route(
                "/report.pdf",
                get(|| async { ([(header::CONTENT_TYPE, "application/pdf")], "%PDF-1.4 test") }),
            )
            .route("/big.bin", get(|| async { vec![7u8; 4096] }))
            .route(
                "/moved",
                get(|| async { axum::response::Redirect::temporary("/report.pdf").into_response() }),
            )
            .route(
                "/missing",
                get(|| async { (axum::http::StatusCode::NOT_FOUND, "nope").into_response() }),
            )
    }

    fn local_fetcher(max_size: u64) -> HttpFileFetcher {
        HttpFileFetcher::new(
            FetchConfig::default()
                .with_max_size(max_size)
                .with_timeout_ms(5_000)
                .allow_private_hosts(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success_captures_content_type() {
        let base = serve(test_router()).await;
        let file = local_fetcher(DEFAULT_MAX_SIZE)
            .fetch(&format!("{base}/report.pdf"))
            .await
            .unwrap();
        assert_eq!(&file.bytes[..], b"%PDF-1.4 test");
        assert_eq!(file.content_type.as_deref(), Some("application/pdf"));
    }

    #[tokio::test]
    async fn test_fetch_follows_redirect() {
        let base = serve(test_router()).await;
        let file = local_fetcher(DEFAULT_MAX_SIZE)
            .fetch(&format!("{base}/moved"))
            .await
            .unwrap();
        assert_eq!(&file.bytes[..], b"%PDF-1.4 test");
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        let base = serve(test_router()).await;
        let err = local_fetcher(DEFAULT_MAX_SIZE)
            .fetch(&format!("{base}/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_fetch_enforces_size_limit() {
        let base = serve(test_router()).await;
        let err = local_fetcher(1024)
            .fetch(&format!("{base}/big.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge { max: 1024, .. }));
    }

    #[tokio::test]
    async fn test_fetch_blocks_loopback_by_default() {
        let base = serve(test_router()).await;
        let fetcher = HttpFileFetcher::new(FetchConfig::default()).unwrap();
        let err = fetcher.fetch(&format!("{base}/report.pdf")).await.unwrap_err();
        assert!(matches!(err, FetchError::BlockedHost(_)));
    }
}
