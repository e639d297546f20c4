use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use tracing::{error, info, warn};

use afters_common::{AftersError, ClassificationResult, ContentHash};

use crate::store::PulseStore;

/// What a warm-up from the store found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WarmReport {
    pub loaded: usize,
    pub corrupt: usize,
}

/// Content-hash keyed classification results, kept without TTL.
///
/// Entries are never overwritten. An in-flight set keeps two concurrent
/// classify calls from sending the same hash to the vision service.
#[derive(Default)]
pub struct ClassificationCache {
    entries: RwLock<HashMap<ContentHash, ClassificationResult>>,
    in_flight: Mutex<HashSet<ContentHash>>,
}

impl ClassificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &ContentHash) -> Option<ClassificationResult> {
        self.entries.read().expect("lock poisoned").get(hash).cloned()
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entries.read().expect("lock poisoned").contains_key(hash)
    }

    /// Insert a result unless one already exists. Returns whether it was inserted.
    pub fn insert(&self, result: ClassificationResult) -> bool {
        let mut entries = self.entries.write().expect("lock poisoned");
        if entries.contains_key(&result.content_hash) {
            return false;
        }
        entries.insert(result.content_hash.clone(), result);
        true
    }

    /// Reserve a hash for classification. False if it is cached or another
    /// caller already holds it.
    pub fn claim(&self, hash: &ContentHash) -> bool {
        let mut in_flight = self.in_flight.lock().expect("lock poisoned");
        if self.contains(hash) {
            return false;
        }
        in_flight.insert(hash.clone())
    }

    /// Give up a reservation, whether or not a result was inserted.
    pub fn release(&self, hash: &ContentHash) {
        self.in_flight.lock().expect("lock poisoned").remove(hash);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load persisted results. Rows that fail validation are evicted from the
    /// store and left out, so they are classified again on next sight.
    pub async fn warm(&self, store: &dyn PulseStore) -> anyhow::Result<WarmReport> {
        let rows = store.load_classifications().await?;
        let mut report = WarmReport::default();

        for row in rows {
            match row.into_result() {
                Ok(result) => {
                    if self.insert(result) {
                        report.loaded += 1;
                    }
                }
                Err(AftersError::CacheCorruption {
                    content_hash,
                    reason,
                }) => {
                    warn!(%content_hash, %reason, "Corrupt cached classification, evicting");
                    report.corrupt += 1;
                    if let Err(e) = store.evict_classification(&content_hash).await {
                        error!(%content_hash, error = %e, "Failed to evict corrupt classification");
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            loaded = report.loaded,
            corrupt = report.corrupt,
            "Classification cache warmed"
        );
        Ok(report)
    }
}
