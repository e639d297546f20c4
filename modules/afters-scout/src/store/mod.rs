//! Persistence for classification results and venue scores.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use afters_common::{AftersError, ClassificationResult, ContentHash, Vibe, VenueScore};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// A classification row as persisted, before validation.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredClassification {
    pub content_hash: String,
    pub media_item_id: Uuid,
    pub energy: i16,
    pub crowd: i16,
    pub vibe: String,
    pub confidence: f64,
    pub low_confidence: bool,
    pub classified_at: DateTime<Utc>,
}

impl From<&ClassificationResult> for StoredClassification {
    fn from(r: &ClassificationResult) -> Self {
        Self {
            content_hash: r.content_hash.to_string(),
            media_item_id: r.media_item_id,
            energy: r.energy as i16,
            crowd: r.crowd as i16,
            vibe: r.vibe.as_str().to_string(),
            confidence: r.confidence,
            low_confidence: r.low_confidence,
            classified_at: r.classified_at,
        }
    }
}

impl StoredClassification {
    /// Validate a persisted row. Anything out of range is corruption.
    pub fn into_result(self) -> Result<ClassificationResult, AftersError> {
        let corrupt = |reason: String| AftersError::CacheCorruption {
            content_hash: self.content_hash.clone(),
            reason,
        };

        let content_hash = ContentHash::from_hex(&self.content_hash)
            .ok_or_else(|| corrupt("content hash is not a sha256 hex digest".into()))?;
        let level = |name: &str, v: i16| -> Result<u8, AftersError> {
            if (1..=10).contains(&v) {
                Ok(v as u8)
            } else {
                Err(corrupt(format!("{name} {v} outside 1..=10")))
            }
        };
        let energy = level("energy", self.energy)?;
        let crowd = level("crowd", self.crowd)?;
        let vibe: Vibe = self.vibe.parse().map_err(corrupt)?;
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(corrupt(format!("confidence {} outside 0..=1", self.confidence)));
        }

        Ok(ClassificationResult {
            media_item_id: self.media_item_id,
            content_hash,
            energy,
            crowd,
            vibe,
            confidence: self.confidence,
            low_confidence: self.low_confidence,
            classified_at: self.classified_at,
        })
    }
}

/// Durable state behind the classification cache and the score board.
///
/// Classifications are append-only: appending a hash that already exists is
/// a no-op, never an overwrite.
#[async_trait]
pub trait PulseStore: Send + Sync {
    async fn load_classifications(&self) -> anyhow::Result<Vec<StoredClassification>>;

    async fn append_classification(&self, result: &ClassificationResult) -> anyhow::Result<()>;

    /// Remove a row found to be corrupt.
    async fn evict_classification(&self, content_hash: &str) -> anyhow::Result<()>;

    async fn upsert_score(&self, score: &VenueScore) -> anyhow::Result<()>;

    async fn load_scores(&self) -> anyhow::Result<Vec<VenueScore>>;
}
