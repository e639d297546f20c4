use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use afters_common::{ClassificationResult, Clock, MediaItem, Vibe};

use super::cache::ClassificationCache;
use super::limiter::RateLimiter;
use super::vision::{VibeReading, VisionService};
use super::ClassificationError;
use crate::config::ClassifyConfig;
use crate::store::PulseStore;

/// A media item paired with its classification.
#[derive(Debug, Clone)]
pub struct ClassifiedItem {
    pub item: MediaItem,
    pub result: ClassificationResult,
    /// Served from the cache without a vision call.
    pub cached: bool,
}

/// An item that produced no result this cycle.
#[derive(Debug, Clone)]
pub struct DroppedItem {
    pub item: MediaItem,
    pub error: ClassificationError,
}

#[derive(Debug, Default)]
pub struct ClassificationBatch {
    pub classified: Vec<ClassifiedItem>,
    pub dropped: Vec<DroppedItem>,
    /// Being classified by a concurrent call; not processed here.
    pub skipped: Vec<MediaItem>,
    /// Vision calls made, retries included.
    pub calls: u32,
}

impl ClassificationBatch {
    pub fn results(&self) -> impl Iterator<Item = &ClassificationResult> {
        self.classified.iter().map(|c| &c.result)
    }

    pub fn cache_hits(&self) -> usize {
        self.classified.iter().filter(|c| c.cached).count()
    }
}

struct BatchOutcome {
    classified: Vec<ClassifiedItem>,
    dropped: Vec<DroppedItem>,
    calls: u32,
}

/// Cached, batched, rate-limited front to the vision service.
pub struct ClassificationClient {
    vision: Arc<dyn VisionService>,
    cache: Arc<ClassificationCache>,
    store: Arc<dyn PulseStore>,
    limiter: RateLimiter,
    config: ClassifyConfig,
    clock: Arc<dyn Clock>,
}

impl ClassificationClient {
    pub fn new(
        vision: Arc<dyn VisionService>,
        cache: Arc<ClassificationCache>,
        store: Arc<dyn PulseStore>,
        config: ClassifyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = RateLimiter::new(config.max_calls_per_window, config.rate_window);
        Self {
            vision,
            cache,
            store,
            limiter,
            config,
            clock,
        }
    }

    pub fn cache(&self) -> &ClassificationCache {
        &self.cache
    }

    /// Items per vision call.
    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Classify `items`, calling the vision service only for hashes not yet cached.
    ///
    /// Items that still fail after retries come back in `dropped`; nothing
    /// here fails the call as a whole.
    pub async fn classify(&self, items: Vec<MediaItem>) -> ClassificationBatch {
        let mut batch = ClassificationBatch::default();
        let mut pending = Vec::new();

        for item in items {
            if let Some(result) = self.cache.get(&item.content_hash) {
                debug!(post_key = %item.post_key, "Classification cache hit");
                batch.classified.push(ClassifiedItem {
                    item,
                    result,
                    cached: true,
                });
            } else if self.cache.claim(&item.content_hash) {
                pending.push(item);
            } else {
                debug!(post_key = %item.post_key, "Already being classified elsewhere");
                batch.skipped.push(item);
            }
        }

        if pending.is_empty() {
            return batch;
        }

        let chunks: Vec<Vec<MediaItem>> = pending
            .chunks(self.config.batch_size.max(1))
            .map(<[MediaItem]>::to_vec)
            .collect();
        let chunk_count = chunks.len();

        let outcomes: Vec<BatchOutcome> = stream::iter(chunks)
            .map(|chunk| self.run_batch(chunk))
            .buffer_unordered(self.config.max_concurrent_batches.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            batch.classified.extend(outcome.classified);
            batch.dropped.extend(outcome.dropped);
            batch.calls += outcome.calls;
        }

        info!(
            batches = chunk_count,
            classified = batch.classified.len() - batch.cache_hits(),
            cache_hits = batch.cache_hits(),
            dropped = batch.dropped.len(),
            calls = batch.calls,
            "Classification pass complete"
        );
        batch
    }

    async fn run_batch(&self, chunk: Vec<MediaItem>) -> BatchOutcome {
        let locators: Vec<String> = chunk.iter().map(|i| i.media_locator.clone()).collect();
        let mut calls = 0;
        let mut attempt = 0;

        let readings = loop {
            self.limiter.acquire().await;
            calls += 1;
            let response =
                tokio::time::timeout(self.config.call_timeout, self.vision.classify_batch(&locators))
                    .await
                    .unwrap_or(Err(ClassificationError::Timeout))
                    .and_then(|values| {
                        if values.len() == chunk.len() {
                            Ok(values)
                        } else {
                            Err(ClassificationError::BatchMismatch {
                                expected: chunk.len(),
                                actual: values.len(),
                            })
                        }
                    });

            match response {
                Ok(values) => break Ok(values),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.retry_delay(attempt);
                    warn!(
                        size = chunk.len(),
                        attempt = attempt + 1,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Classification batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        let mut outcome = BatchOutcome {
            classified: Vec::new(),
            dropped: Vec::new(),
            calls,
        };

        match readings {
            Ok(values) => {
                let now = self.clock.now();
                for (item, value) in chunk.into_iter().zip(values) {
                    match self.to_result(&item, value, now) {
                        Ok(result) => {
                            self.cache.insert(result.clone());
                            if let Err(e) = self.store.append_classification(&result).await {
                                warn!(content_hash = %result.content_hash, error = %e, "Failed to persist classification");
                            }
                            self.cache.release(&item.content_hash);
                            outcome.classified.push(ClassifiedItem {
                                item,
                                result,
                                cached: false,
                            });
                        }
                        Err(error) => {
                            warn!(post_key = %item.post_key, %error, "Dropping item with invalid reading");
                            self.cache.release(&item.content_hash);
                            outcome.dropped.push(DroppedItem { item, error });
                        }
                    }
                }
            }
            Err(error) => {
                warn!(
                    size = chunk.len(),
                    attempts = calls,
                    %error,
                    "Classification batch dropped for this cycle"
                );
                for item in chunk {
                    self.cache.release(&item.content_hash);
                    outcome.dropped.push(DroppedItem {
                        item,
                        error: error.clone(),
                    });
                }
            }
        }

        outcome
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = self.config.retry_base.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }

    fn to_result(
        &self,
        item: &MediaItem,
        value: Value,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<ClassificationResult, ClassificationError> {
        let reading: VibeReading = serde_json::from_value(value)
            .map_err(|e| ClassificationError::Schema(e.to_string()))?;

        for (name, level) in [("energy", reading.energy), ("crowd", reading.crowd)] {
            if !(1..=10).contains(&level) {
                return Err(ClassificationError::Schema(format!(
                    "{name} {level} outside 1..=10"
                )));
            }
        }
        let vibe: Vibe = reading.vibe.parse().map_err(ClassificationError::Schema)?;
        if !reading.confidence.is_finite() || !(0.0..=1.0).contains(&reading.confidence) {
            return Err(ClassificationError::Schema(format!(
                "confidence {} outside 0..=1",
                reading.confidence
            )));
        }

        Ok(ClassificationResult {
            media_item_id: item.id,
            content_hash: item.content_hash.clone(),
            energy: reading.energy,
            crowd: reading.crowd,
            vibe,
            confidence: reading.confidence,
            low_confidence: reading.confidence < self.config.confidence_threshold,
            classified_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{media_item, MockVision};
    use afters_common::ManualClock;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn client(vision: Arc<MockVision>, config: ClassifyConfig) -> (ClassificationClient, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let client = ClassificationClient::new(
            vision,
            Arc::new(ClassificationCache::new()),
            store.clone(),
            config,
            Arc::new(ManualClock::new(Utc::now())),
        );
        (client, store)
    }

    fn items(n: usize) -> Vec<MediaItem> {
        let venue = Uuid::new_v4();
        (0..n)
            .map(|i| media_item(venue, &format!("post-{i}"), Utc::now()))
            .collect()
    }

    #[tokio::test]
    async fn batches_uncached_items_up_to_batch_size() {
        let vision = Arc::new(MockVision::new());
        let config = ClassifyConfig {
            batch_size: 2,
            ..ClassifyConfig::default()
        };
        let (client, store) = client(vision.clone(), config);

        let batch = client.classify(items(5)).await;

        assert_eq!(batch.classified.len(), 5);
        assert!(batch.dropped.is_empty());
        assert_eq!(vision.calls(), 3);
        assert_eq!(store.classification_count(), 5);
    }

    #[tokio::test]
    async fn each_hash_is_sent_at_most_once() {
        let vision = Arc::new(MockVision::new());
        let (client, _) = client(vision.clone(), ClassifyConfig::default());
        let media = items(3);

        let first = client.classify(media.clone()).await;
        let second = client.classify(media.clone()).await;

        assert_eq!(first.cache_hits(), 0);
        assert_eq!(second.cache_hits(), 3);
        assert_eq!(vision.calls(), 1);
        assert_eq!(vision.locators_seen().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_batch_is_dropped_after_retries() {
        let vision = Arc::new(MockVision::new().with_delay(Duration::from_secs(600)));
        let config = ClassifyConfig {
            max_retries: 2,
            call_timeout: Duration::from_secs(5),
            ..ClassifyConfig::default()
        };
        let (client, store) = client(vision.clone(), config);
        let media = items(5);

        let batch = client.classify(media.clone()).await;

        assert!(batch.classified.is_empty());
        assert_eq!(batch.dropped.len(), 5);
        assert!(batch
            .dropped
            .iter()
            .all(|d| d.error == ClassificationError::Timeout));
        assert_eq!(batch.calls, 3);
        assert_eq!(store.classification_count(), 0);
        // Released: the same items can be tried again later.
        assert!(client.cache().claim(&media[0].content_hash));
    }

    #[tokio::test]
    async fn invalid_reading_drops_only_that_item() {
        let media = items(3);
        let vision = Arc::new(MockVision::new().on_locator(
            &media[1].media_locator,
            json!({ "energy": 14, "crowd": 3, "vibe": "Chill", "confidence": 0.9 }),
        ));
        let (client, _) = client(vision, ClassifyConfig::default());

        let batch = client.classify(media.clone()).await;

        assert_eq!(batch.classified.len(), 2);
        assert_eq!(batch.dropped.len(), 1);
        assert_eq!(batch.dropped[0].item.id, media[1].id);
        assert!(matches!(batch.dropped[0].error, ClassificationError::Schema(_)));
    }

    #[tokio::test]
    async fn unknown_vibe_is_a_schema_violation() {
        let media = items(1);
        let vision = Arc::new(MockVision::new().on_locator(
            &media[0].media_locator,
            json!({ "energy": 5, "crowd": 5, "vibe": "Gothic", "confidence": 0.9 }),
        ));
        let (client, _) = client(vision, ClassifyConfig::default());

        let batch = client.classify(media).await;
        assert_eq!(batch.dropped.len(), 1);
    }

    #[tokio::test]
    async fn low_confidence_results_are_kept_and_flagged() {
        let media = items(1);
        let vision = Arc::new(MockVision::new().on_locator(
            &media[0].media_locator,
            json!({ "energy": 8, "crowd": 8, "vibe": "techno", "confidence": 0.1 }),
        ));
        let (client, store) = client(vision, ClassifyConfig::default());

        let batch = client.classify(media).await;

        assert_eq!(batch.classified.len(), 1);
        let result = &batch.classified[0].result;
        assert!(result.low_confidence);
        assert_eq!(result.vibe, Vibe::Techno);
        assert_eq!(store.classification_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success_is_retried() {
        let vision = Arc::new(MockVision::new().fail_times(1, ClassificationError::RateLimited));
        let (client, _) = client(vision.clone(), ClassifyConfig::default());

        let batch = client.classify(items(2)).await;

        assert_eq!(batch.classified.len(), 2);
        assert_eq!(batch.calls, 2);
        assert_eq!(vision.calls(), 2);
    }

    #[tokio::test]
    async fn length_mismatch_fails_the_batch() {
        let vision = Arc::new(MockVision::new().truncate_responses(1));
        let config = ClassifyConfig {
            max_retries: 0,
            ..ClassifyConfig::default()
        };
        let (client, _) = client(vision, config);

        let batch = client.classify(items(3)).await;

        assert_eq!(batch.dropped.len(), 3);
        assert!(matches!(
            batch.dropped[0].error,
            ClassificationError::BatchMismatch { expected: 3, actual: 1 }
        ));
    }

    #[tokio::test]
    async fn rejected_request_is_not_retried() {
        let vision = Arc::new(MockVision::new().fail_times(
            5,
            ClassificationError::Rejected {
                status: 400,
                message: "unsupported image".into(),
            },
        ));
        let (client, _) = client(vision.clone(), ClassifyConfig::default());

        let batch = client.classify(items(2)).await;
        assert_eq!(batch.dropped.len(), 2);
        assert_eq!(vision.calls(), 1);
    }
}
