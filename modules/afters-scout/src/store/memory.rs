use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use afters_common::{ClassificationResult, VenueScore};

use super::{PulseStore, StoredClassification};

/// In-process store. State is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    classifications: Mutex<Vec<StoredClassification>>,
    scores: Mutex<HashMap<Uuid, VenueScore>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed raw rows, bypassing validation.
    pub fn with_rows(rows: Vec<StoredClassification>) -> Self {
        Self {
            classifications: Mutex::new(rows),
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn classification_count(&self) -> usize {
        self.classifications.lock().expect("lock poisoned").len()
    }

    pub fn score(&self, venue_id: Uuid) -> Option<VenueScore> {
        self.scores.lock().expect("lock poisoned").get(&venue_id).cloned()
    }
}

#[async_trait]
impl PulseStore for MemoryStore {
    async fn load_classifications(&self) -> anyhow::Result<Vec<StoredClassification>> {
        Ok(self.classifications.lock().expect("lock poisoned").clone())
    }

    async fn append_classification(&self, result: &ClassificationResult) -> anyhow::Result<()> {
        let mut rows = self.classifications.lock().expect("lock poisoned");
        let hash = result.content_hash.as_str();
        if !rows.iter().any(|r| r.content_hash == hash) {
            rows.push(StoredClassification::from(result));
        }
        Ok(())
    }

    async fn evict_classification(&self, content_hash: &str) -> anyhow::Result<()> {
        self.classifications
            .lock()
            .expect("lock poisoned")
            .retain(|r| r.content_hash != content_hash);
        Ok(())
    }

    async fn upsert_score(&self, score: &VenueScore) -> anyhow::Result<()> {
        self.scores
            .lock()
            .expect("lock poisoned")
            .insert(score.venue_id, score.clone());
        Ok(())
    }

    async fn load_scores(&self) -> anyhow::Result<Vec<VenueScore>> {
        Ok(self.scores.lock().expect("lock poisoned").values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afters_common::{content_hash, Platform, Vibe};
    use chrono::Utc;

    fn result(key: &str, energy: u8) -> ClassificationResult {
        ClassificationResult {
            media_item_id: Uuid::new_v4(),
            content_hash: content_hash(Platform::Instagram, key, "https://cdn/x.jpg"),
            energy,
            crowd: 5,
            vibe: Vibe::Chill,
            confidence: 0.9,
            low_confidence: false,
            classified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_never_overwrites() {
        let store = MemoryStore::new();
        store.append_classification(&result("a", 3)).await.unwrap();
        store.append_classification(&result("a", 9)).await.unwrap();

        let rows = store.load_classifications().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].energy, 3);
    }

    #[tokio::test]
    async fn evict_removes_row() {
        let store = MemoryStore::new();
        let r = result("a", 3);
        store.append_classification(&r).await.unwrap();
        store.evict_classification(r.content_hash.as_str()).await.unwrap();
        assert_eq!(store.classification_count(), 0);
    }
}
