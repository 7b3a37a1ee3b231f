//! Pairing artifact: the scannable rendering of the current pairing token.
//!
//! The file exists exactly while the session is pairing. New tokens replace
//! it through a temp file and rename, so readers never observe a partial or
//! mixed artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use qrcode::render::svg;
use qrcode::QrCode;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Pairing artifact errors
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("failed to render pairing token: {0}")]
    Render(String),
    #[error("failed to write pairing artifact {path}: {message}")]
    Io { path: String, message: String },
}

/// Turns an opaque pairing token into displayable bytes.
pub trait PairingRenderer: Send + Sync {
    fn render(&self, token: &str) -> Result<Vec<u8>, PairingError>;

    /// Content type served for the rendered bytes.
    fn content_type(&self) -> &'static str;
}

/// Renders tokens as an SVG QR code.
#[derive(Debug, Clone)]
pub struct SvgQrRenderer {
    pub min_size: u32,
}

impl Default for SvgQrRenderer {
    fn default() -> Self {
        Self { min_size: 320 }
    }
}

impl PairingRenderer for SvgQrRenderer {
    fn render(&self, token: &str) -> Result<Vec<u8>, PairingError> {
        let code = QrCode::new(token.as_bytes()).map_err(|e| PairingError::Render(e.to_string()))?;
        let image = code
            .render::<svg::Color<'_>>()
            .min_dimensions(self.min_size, self.min_size)
            .quiet_zone(true)
            .build();
        Ok(image.into_bytes())
    }

    fn content_type(&self) -> &'static str {
        "image/svg+xml"
    }
}

/// The on-disk pairing artifact.
#[derive(Clone)]
pub struct PairingArtifact {
    path: PathBuf,
    renderer: Arc<dyn PairingRenderer>,
}

impl std::fmt::Debug for PairingArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingArtifact")
            .field("path", &self.path)
            .field("content_type", &self.renderer.content_type())
            .finish()
    }
}

impl PairingArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_renderer(path, Arc::new(SvgQrRenderer::default()))
    }

    pub fn with_renderer(path: impl Into<PathBuf>, renderer: Arc<dyn PairingRenderer>) -> Self {
        Self {
            path: path.into(),
            renderer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_type(&self) -> &'static str {
        self.renderer.content_type()
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Render `token` and atomically replace any existing artifact.
    ///
    /// On failure the previous artifact is removed as well: a code that was
    /// superseded must never stay scannable.
    pub async fn publish(&self, token: &str) -> Result<(), PairingError> {
        let result = self.write_artifact(token).await;
        if result.is_err() {
            self.retire().await;
        }
        result
    }

    async fn write_artifact(&self, token: &str) -> Result<(), PairingError> {
        let bytes = self.renderer.render(token)?;
        let io_err = |e: std::io::Error| PairingError::Io {
            path: self.path.display().to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let temp_path = self.temp_path();
        if let Err(e) = self.replace_from(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(e));
        }
        Ok(())
    }

    async fn replace_from(&self, temp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(temp_path, &self.path).await
    }

    /// Remove the artifact. Returns whether a file was deleted.
    pub async fn retire(&self) -> bool {
        match fs::remove_file(&self.path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to remove pairing artifact: {}", e);
                false
            }
        }
    }

    /// Current artifact bytes, or `None` when pairing is not pending.
    pub async fn load(&self) -> Option<Vec<u8>> {
        tokio::fs::read(&self.path).await.ok()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "pairing".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
