//! In-memory credential backend for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CredentialBackend, CredentialError};

/// In-memory backend for tests. Can be told to fail the next N saves.
#[derive(Default)]
pub struct MemoryCredentialBackend {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failing_saves: AtomicUsize,
    save_count: AtomicUsize,
}

impl MemoryCredentialBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(self, profile: &str, blob: &[u8]) -> Self {
        self.blobs.lock().insert(profile.to_string(), blob.to_vec());
        self
    }

    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    pub fn get(&self, profile: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(profile).cloned()
    }
}

#[async_trait]
impl CredentialBackend for MemoryCredentialBackend {
    async fn load(&self, profile: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        Ok(self.get(profile))
    }

    async fn save(&self, profile: &str, blob: &[u8]) -> Result<(), CredentialError> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CredentialError::IoError("injected save failure".to_string()));
        }
        self.blobs.lock().insert(profile.to_string(), blob.to_vec());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, profile: &str) -> Result<bool, CredentialError> {
        Ok(self.blobs.lock().remove(profile).is_some())
    }
}
