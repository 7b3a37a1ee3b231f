//! Credential storage
//!
//! Persists the transport's opaque credential blob, one blob per profile.
//! The file backend writes through a temp file and an atomic rename so a
//! concurrent reader sees either the previous blob or the new one in full.

use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::logging::targets;

#[cfg(any(test, feature = "test-util"))]
mod memory;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryCredentialBackend;

/// Maximum profile id length
pub const MAX_PROFILE_LENGTH: usize = 64;

/// Maximum credential blob size (4 MB)
pub const MAX_BLOB_LENGTH: usize = 4 * 1024 * 1024;

const BLOB_EXTENSION: &str = "creds";

/// Credential store errors
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialError {
    /// Profile id is empty, too long, or contains path characters
    InvalidProfile(String),
    /// Blob exceeds [`MAX_BLOB_LENGTH`]
    BlobTooLarge(usize),
    /// I/O error
    IoError(String),
    /// Operation timed out
    Timeout,
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidProfile(p) => write!(f, "Invalid profile id: {:?}", p),
            Self::BlobTooLarge(len) => write!(
                f,
                "Credential blob of {} bytes exceeds maximum of {} bytes",
                len, MAX_BLOB_LENGTH
            ),
            Self::IoError(msg) => write!(f, "I/O error: {}", msg),
            Self::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for CredentialError {}

fn is_retryable(e: &CredentialError) -> bool {
    matches!(e, CredentialError::IoError(_) | CredentialError::Timeout)
}

/// Validate a profile id for use as a storage key.
pub fn validate_profile(profile: &str) -> Result<(), CredentialError> {
    let ok = !profile.is_empty()
        && profile.len() <= MAX_PROFILE_LENGTH
        && profile
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CredentialError::InvalidProfile(profile.to_string()))
    }
}

/// Retry policy for backend operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub timeout: Duration,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    /// Loads run once at startup and are fatal on failure: single attempt.
    pub fn for_load() -> Self {
        Self {
            max_retries: 0,
            timeout: Duration::from_secs(5),
            backoff: Vec::new(),
        }
    }

    /// Saves retry briefly before giving up until the next change.
    pub fn for_save() -> Self {
        Self {
            max_retries: 2,
            timeout: Duration::from_secs(5),
            backoff: vec![Duration::from_millis(100), Duration::from_millis(500)],
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            timeout: Duration::from_secs(5),
            backoff: Vec::new(),
        }
    }
}

/// Storage backend for credential blobs
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    async fn load(&self, profile: &str) -> Result<Option<Vec<u8>>, CredentialError>;

    /// Replace the stored blob in full.
    async fn save(&self, profile: &str, blob: &[u8]) -> Result<(), CredentialError>;

    async fn delete(&self, profile: &str) -> Result<bool, CredentialError>;
}

/// Credential store wrapping a backend with validation and retry
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn CredentialBackend>,
    save_policy: RetryPolicy,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn CredentialBackend>) -> Self {
        Self {
            backend,
            save_policy: RetryPolicy::for_save(),
        }
    }

    pub fn with_save_policy(mut self, policy: RetryPolicy) -> Self {
        self.save_policy = policy;
        self
    }

    /// Load the blob for `profile`; `None` means first-time pairing.
    pub async fn load(&self, profile: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        validate_profile(profile)?;
        with_retry(&RetryPolicy::for_load(), || self.backend.load(profile)).await
    }

    pub async fn save(&self, profile: &str, blob: &[u8]) -> Result<(), CredentialError> {
        validate_profile(profile)?;
        if blob.len() > MAX_BLOB_LENGTH {
            return Err(CredentialError::BlobTooLarge(blob.len()));
        }
        with_retry(&self.save_policy, || self.backend.save(profile, blob)).await
    }

    /// Remove the stored blob. Returns whether anything was deleted.
    pub async fn clear(&self, profile: &str) -> Result<bool, CredentialError> {
        validate_profile(profile)?;
        self.backend.delete(profile).await
    }
}

async fn with_retry<F, Fut, T>(policy: &RetryPolicy, op: F) -> Result<T, CredentialError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, CredentialError>>,
{
    let mut last_error = CredentialError::Timeout;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            if let Some(delay) = policy.backoff.get(attempt - 1) {
                tokio::time::sleep(*delay).await;
            }
        }

        match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                tracing::debug!(
                    target: targets::CREDENTIALS,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    error = %e,
                    "credential operation failed"
                );
                last_error = e;
            }
            Err(_) => {
                tracing::debug!(
                    target: targets::CREDENTIALS,
                    attempt = attempt + 1,
                    "credential operation timed out"
                );
                last_error = CredentialError::Timeout;
            }
        }
    }

    Err(last_error)
}

// ============================================================================
// File backend
// ============================================================================

/// Stores each profile's blob at `<dir>/<profile>.creds`.
pub struct FileCredentialBackend {
    dir: PathBuf,
}

impl FileCredentialBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CredentialError::IoError(e.to_string()))?;
        Ok(Self { dir })
    }

    pub fn blob_path(&self, profile: &str) -> PathBuf {
        self.dir.join(format!("{profile}.{BLOB_EXTENSION}"))
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), CredentialError> {
    let temp_path = path.with_extension(format!("{BLOB_EXTENSION}.tmp"));
    let result = (|| {
        let mut file =
            File::create(&temp_path).map_err(|e| CredentialError::IoError(e.to_string()))?;
        IoWrite::write_all(&mut file, content)
            .map_err(|e| CredentialError::IoError(e.to_string()))?;
        file.sync_all()
            .map_err(|e| CredentialError::IoError(e.to_string()))?;
        fs::rename(&temp_path, path).map_err(|e| CredentialError::IoError(e.to_string()))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

#[async_trait]
impl CredentialBackend for FileCredentialBackend {
    async fn load(&self, profile: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        match fs::read(self.blob_path(profile)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CredentialError::IoError(e.to_string())),
        }
    }

    async fn save(&self, profile: &str, blob: &[u8]) -> Result<(), CredentialError> {
        write_atomic(&self.blob_path(profile), blob)?;
        tracing::debug!(
            target: targets::CREDENTIALS,
            profile = %profile,
            bytes = blob.len(),
            "credentials saved"
        );
        Ok(())
    }

    async fn delete(&self, profile: &str) -> Result<bool, CredentialError> {
        match fs::remove_file(self.blob_path(profile)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CredentialError::IoError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_store(dir: &TempDir) -> (CredentialStore, Arc<FileCredentialBackend>) {
        let backend = Arc::new(FileCredentialBackend::new(dir.path().join("credentials")).unwrap());
        (CredentialStore::new(backend.clone()), backend)
    }

    #[test]
    fn test_validate_profile() {
        assert!(validate_profile("default").is_ok());
        assert!(validate_profile("shop_2-eu").is_ok());
        assert!(validate_profile("").is_err());
        assert!(validate_profile("../etc").is_err());
        assert!(validate_profile("a/b").is_err());
        assert!(validate_profile(&"x".repeat(MAX_PROFILE_LENGTH + 1)).is_err());
    }

    #[tokio::test]
    async fn test_file_round_trip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let (store, _) = file_store(&dir);
        let blob: Vec<u8> = (0..=255u8).chain([0, 0, 10, 13]).collect();

        store.save("default", &blob).await.unwrap();
        let loaded = store.load("default").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(blob.as_slice()));
    }

    #[tokio::test]
    async fn test_load_missing_profile_is_none() {
        let dir = TempDir::new().unwrap();
        let (store, _) = file_store(&dir);
        assert_eq!(store.load("fresh").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_overwrites_in_full() {
        let dir = TempDir::new().unwrap();
        let (store, backend) = file_store(&dir);

        store.save("default", b"a much longer first blob").await.unwrap();
        store.save("default", b"short").await.unwrap();

        assert_eq!(store.load("default").await.unwrap().unwrap(), b"short");
        let leftovers: Vec<_> = fs::read_dir(backend.blob_path("default").parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp file should be renamed away");
    }

    #[tokio::test]
    async fn test_profiles_are_isolated() {
        let dir = TempDir::new().unwrap();
        let (store, _) = file_store(&dir);
        store.save("one", b"1").await.unwrap();
        store.save("two", b"2").await.unwrap();
        assert_eq!(store.load("one").await.unwrap().unwrap(), b"1");
        assert_eq!(store.load("two").await.unwrap().unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_clear_removes_blob() {
        let dir = TempDir::new().unwrap();
        let (store, _) = file_store(&dir);
        store.save("default", b"creds").await.unwrap();
        assert!(store.clear("default").await.unwrap());
        assert!(!store.clear("default").await.unwrap());
        assert_eq!(store.load("default").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_blob_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (store, backend) = file_store(&dir);
        // A directory where the blob should be makes the read fail.
        fs::create_dir_all(backend.blob_path("broken")).unwrap();
        assert!(matches!(
            store.load("broken").await,
            Err(CredentialError::IoError(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_profile_rejected_before_backend() {
        let backend = Arc::new(MemoryCredentialBackend::new());
        let store = CredentialStore::new(backend.clone());
        assert!(matches!(
            store.save("../x", b"blob").await,
            Err(CredentialError::InvalidProfile(_))
        ));
        assert_eq!(backend.save_count(), 0);
    }

    #[tokio::test]
    async fn test_blob_too_large_rejected() {
        let store = CredentialStore::new(Arc::new(MemoryCredentialBackend::new()));
        let blob = vec![0u8; MAX_BLOB_LENGTH + 1];
        assert_eq!(
            store.save("default", &blob).await,
            Err(CredentialError::BlobTooLarge(MAX_BLOB_LENGTH + 1))
        );
    }

    #[tokio::test]
    async fn test_save_retries_transient_failure() {
        let backend = Arc::new(MemoryCredentialBackend::new());
        backend.fail_next_saves(1);
        let store = CredentialStore::new(backend.clone()).with_save_policy(RetryPolicy {
            max_retries: 1,
            timeout: Duration::from_secs(1),
            backoff: vec![Duration::from_millis(1)],
        });
        store.save("default", b"blob").await.unwrap();
        assert_eq!(backend.get("default").unwrap(), b"blob");
    }

    #[tokio::test]
    async fn test_save_gives_up_after_policy() {
        let backend = Arc::new(MemoryCredentialBackend::new());
        backend.fail_next_saves(5);
        let store = CredentialStore::new(backend.clone()).with_save_policy(RetryPolicy::none());
        assert!(store.save("default", b"blob").await.is_err());
        assert_eq!(backend.get("default"), None);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            CredentialError::IoError("disk full".into()).to_string(),
            "I/O error: disk full"
        );
        assert!(CredentialError::InvalidProfile("a/b".into())
            .to_string()
            .contains("a/b"));
    }
}
