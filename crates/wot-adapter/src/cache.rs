use std::sync::Arc;

use hashbrown::HashMap;

use serde_json::Value;

use sha2::{Digest, Sha256};

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Length of a content digest, in bytes.
pub const DIGEST_LENGTH: usize = 32;

/// Computes the `SHA-256` digest of a raw description body.
#[must_use]
pub fn digest(body: &[u8]) -> [u8; DIGEST_LENGTH] {
    let mut digest = [0u8; DIGEST_LENGTH];
    digest.copy_from_slice(Sha256::digest(body).as_slice());
    digest
}

/// The last successful fetch of an endpoint.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    digest: [u8; DIGEST_LENGTH],
    description: Arc<Value>,
    fetched_at: Instant,
}

impl CacheEntry {
    pub(crate) const fn new(
        digest: [u8; DIGEST_LENGTH],
        description: Arc<Value>,
        fetched_at: Instant,
    ) -> Self {
        Self {
            digest,
            description,
            fetched_at,
        }
    }

    /// Returns the digest of the fetched body.
    #[must_use]
    pub const fn digest(&self) -> &[u8; DIGEST_LENGTH] {
        &self.digest
    }

    /// Returns the parsed description.
    #[must_use]
    pub const fn description(&self) -> &Arc<Value> {
        &self.description
    }

    /// Returns the instant of the last fetch.
    #[must_use]
    pub const fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub(crate) fn is_fresh(&self, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < window
    }

    // Never moves the fetch instant backwards.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.fetched_at = self.fetched_at.max(now);
    }
}

// Holding the slot lock serializes fetches to the same endpoint.
pub(crate) type Slot = Arc<Mutex<Option<CacheEntry>>>;

/// A fingerprint cache.
///
/// It maps each endpoint to its last fetched description, so that unchanged
/// descriptions are neither fetched again within the freshness window nor
/// parsed again when their content did not change.
///
/// Entries are created on the first fetch of an endpoint and live as long as
/// the cache.
#[derive(Debug, Default)]
pub struct FingerprintCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl FingerprintCache {
    /// Creates an empty [`FingerprintCache`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the entry for an endpoint.
    pub async fn entry(&self, endpoint: &str) -> Option<CacheEntry> {
        let slot = self.slots.lock().await.get(endpoint).cloned()?;
        let entry = slot.lock().await;
        entry.clone()
    }

    /// Returns the number of endpoints with a cached description.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut length = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                length += 1;
            }
        }
        length
    }

    /// Checks whether no description is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub(crate) async fn slot(&self, endpoint: &str) -> Slot {
        self.slots
            .lock()
            .await
            .entry_ref(endpoint)
            .or_default()
            .clone()
    }
}
