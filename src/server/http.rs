//! Control bridge HTTP surface
//!
//! Implements:
//! - Index banner (GET /)
//! - Pairing artifact (GET /qr)
//! - Liveness and session status (GET /health, GET /api/status)
//! - Outbound sends (POST /api/send, POST /api/upload)
//!
//! Every handler reads the session handle slot at call time and never keeps
//! a handle across a suspension point it does not own.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::logging::targets;
use crate::media::{fetch_document, FetchError, FileFetch};
use crate::session::{HandleSlot, PairingArtifact, SessionSnapshot};
use crate::transport::{
    is_valid_recipient, normalize_jid, OutboundContent, SessionHandle, TransportError,
};

/// Default max request body size (256KB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 262144;

pub const INDEX_BANNER: &str = "Whatsapp Bot interface index!";
pub const QR_NOT_READY: &str = "QR not ready";

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Max JSON body size for the send endpoints
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Shared state for the bridge handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HttpConfig>,
    pub slot: HandleSlot,
    pub pairing: PairingArtifact,
    pub fetcher: Arc<dyn FileFetch>,
    pub status: watch::Receiver<SessionSnapshot>,
    /// Server start time (Unix timestamp)
    pub start_time: i64,
}

impl AppState {
    pub fn new(
        slot: HandleSlot,
        pairing: PairingArtifact,
        fetcher: Arc<dyn FileFetch>,
        status: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        AppState {
            config: Arc::new(HttpConfig::default()),
            slot,
            pairing,
            fetcher,
            status,
            start_time: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_config(mut self, config: HttpConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

/// Build the bridge router.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/", get(index_handler))
        .route("/qr", get(qr_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/send", post(send_handler))
        .route("/api/upload", post(upload_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

// ============================================================================
// Responses
// ============================================================================

/// JSON error payload: `{ "ok": false, "error": "..." }`
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub ok: bool,
    pub error: String,
}

impl ApiErrorResponse {
    pub fn new(error: &str) -> Self {
        ApiErrorResponse {
            ok: false,
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub ok: bool,
    pub to: String,
    pub message_id: String,
}

fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(ApiErrorResponse::new(message))).into_response()
}

fn not_connected() -> Response {
    api_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "WhatsApp session is not connected",
    )
}

fn transport_failure(e: &TransportError) -> Response {
    match e {
        TransportError::NotConnected | TransportError::Closed => not_connected(),
        other => api_error(StatusCode::BAD_GATEWAY, &other.to_string()),
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub to: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub to: String,
    pub file_url: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Parse a JSON body, mapping failures to a 400 with the parser message.
#[allow(clippy::result_large_err)]
fn parse_body<T: DeserializeOwned>(config: &HttpConfig, body: &[u8]) -> Result<T, Response> {
    if body.len() > config.max_body_bytes {
        return Err(api_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"));
    }
    serde_json::from_slice(body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, &format!("SyntaxError: {}", e)))
}

#[allow(clippy::result_large_err)]
fn recipient(to: &str) -> Result<String, Response> {
    if !is_valid_recipient(to) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "`to` must be a phone number, group id, or JID",
        ));
    }
    Ok(normalize_jid(to))
}

/// Send through whatever handle is live right now.
async fn send_now(
    slot: &HandleSlot,
    to: &str,
    content: OutboundContent,
) -> Result<SendResponse, Response> {
    let Some(handle) = slot.current() else {
        return Err(not_connected());
    };
    let handle_id = handle.id();
    match handle.send_message(to, content).await {
        Ok(receipt) => Ok(SendResponse {
            ok: true,
            to: to.to_string(),
            message_id: receipt.message_id,
        }),
        Err(e) => {
            warn!(target: targets::HTTP, to = %to, handle = handle_id, "bridge send failed: {}", e);
            Err(transport_failure(&e))
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET / - plain-text banner.
async fn index_handler() -> &'static str {
    INDEX_BANNER
}

/// GET /qr - current pairing artifact, or 404 while no pairing is pending.
async fn qr_handler(State(state): State<AppState>) -> Response {
    match state.pairing.load().await {
        Some(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, state.pairing.content_type()),
                (header::CACHE_CONTROL, "no-store"),
            ],
            bytes,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, QR_NOT_READY).into_response(),
    }
}

/// GET /health - liveness probe with the session state.
async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime = chrono::Utc::now().timestamp() - state.start_time;
    let session_state = state.status.borrow().state;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSeconds": uptime,
            "session": session_state,
        })),
    )
        .into_response()
}

/// GET /api/status - full session snapshot.
async fn status_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.status.borrow().clone();
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "connected": state.slot.is_active(),
            "session": snapshot,
        })),
    )
        .into_response()
}

/// POST /api/send - `{ to, message }`
async fn send_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let req: SendRequest = match parse_body(&state.config, &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let to = match recipient(&req.to) {
        Ok(to) => to,
        Err(resp) => return resp,
    };
    if req.message.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "`message` must not be empty");
    }

    match send_now(&state.slot, &to, OutboundContent::text(req.message)).await {
        Ok(resp) => {
            debug!(target: targets::HTTP, to = %to, "bridge text sent");
            (StatusCode::OK, Json(resp)).into_response()
        }
        Err(resp) => resp,
    }
}

/// POST /api/upload - `{ to, fileUrl, fileName?, mimeType? }`
async fn upload_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let req: UploadRequest = match parse_body(&state.config, &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let to = match recipient(&req.to) {
        Ok(to) => to,
        Err(resp) => return resp,
    };
    if req.file_url.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "`fileUrl` must not be empty");
    }
    // Fail fast; the slot is read again after the fetch.
    if !state.slot.is_active() {
        return not_connected();
    }

    let document = match fetch_document(
        state.fetcher.as_ref(),
        req.file_url.trim(),
        req.file_name.as_deref(),
        req.mime_type.as_deref(),
    )
    .await
    {
        Ok(document) => document,
        Err(e) => {
            warn!(target: targets::HTTP, url = %req.file_url, "bridge fetch failed: {}", e);
            let status = match e {
                FetchError::InvalidUrl(_)
                | FetchError::UrlTooLong { .. }
                | FetchError::BlockedHost(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            };
            return api_error(status, &format!("failed to fetch file: {}", e));
        }
    };

    let file_name = document.meta.file_name.clone();
    match send_now(&state.slot, &to, document.into_content()).await {
        Ok(resp) => {
            info!(target: targets::HTTP, to = %to, file_name = %file_name, "bridge document sent");
            (StatusCode::OK, Json(resp)).into_response()
        }
        Err(resp) => resp,
    }
}
