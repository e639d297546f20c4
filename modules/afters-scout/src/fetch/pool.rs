use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use afters_common::{content_hash, Clock, MediaItem, VenueTarget};

use super::identity::IdentityPool;
use super::source::{MediaSource, RawPost};
use crate::config::FetchConfig;
use crate::notify::AlertBackend;
use crate::scheduling::{CrawlScheduler, FetchOutcome, OutcomeReport};

/// Everything one fetch produced.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub venue_id: Uuid,
    pub media_items: Vec<MediaItem>,
    pub outcome: FetchOutcome,
    /// The scheduler's decision; `None` if the venue was removed mid-fetch.
    pub report: Option<OutcomeReport>,
}

/// Bounded-concurrency fetch executor.
///
/// Each call to [`fetch`](Self::fetch) runs one attempt against the media
/// source, reports exactly one outcome to the scheduler, and forwards any
/// alert the scheduler raises.
pub struct FetchWorkerPool {
    source: Arc<dyn MediaSource>,
    scheduler: Arc<CrawlScheduler>,
    identities: IdentityPool,
    alerts: Arc<dyn AlertBackend>,
    semaphore: Arc<Semaphore>,
    config: FetchConfig,
    clock: Arc<dyn Clock>,
}

impl FetchWorkerPool {
    pub fn new(
        source: Arc<dyn MediaSource>,
        scheduler: Arc<CrawlScheduler>,
        identities: IdentityPool,
        alerts: Arc<dyn AlertBackend>,
        config: FetchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            source,
            scheduler,
            identities,
            alerts,
            semaphore,
            config,
            clock,
        }
    }

    /// Most fetches that run at once.
    pub fn capacity(&self) -> usize {
        self.config.max_concurrent
    }

    pub async fn fetch(&self, target: VenueTarget) -> FetchResult {
        // The semaphore is never closed, so acquire only fails if it is dropped.
        let _permit = self.semaphore.acquire().await.ok();

        let identity = self.identities.identity(target.backoff.rotation_index);
        let attempt = tokio::time::timeout(
            self.config.request_timeout,
            self.source
                .recent_media(&target, &identity, self.config.max_posts_per_fetch),
        )
        .await;

        let (media_items, outcome) = match attempt {
            Ok(Ok(posts)) => {
                let total = posts.len();
                let items = self.to_media_items(&target, posts);
                info!(
                    venue = %target.name,
                    posts = total,
                    kept = items.len(),
                    slot = identity.slot,
                    "Fetched venue media"
                );
                (items, FetchOutcome::Success)
            }
            Ok(Err(e)) => {
                warn!(venue = %target.name, error = %e, slot = identity.slot, "Fetch failed");
                (Vec::new(), e.outcome())
            }
            Err(_) => {
                warn!(
                    venue = %target.name,
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "Fetch timed out"
                );
                (
                    Vec::new(),
                    FetchOutcome::NetworkError {
                        reason: "timeout".to_string(),
                    },
                )
            }
        };

        let report = self.scheduler.report_outcome(target.id, &outcome);
        if let Some(alert) = report.as_ref().and_then(|r| r.alert.as_ref()) {
            if let Err(e) = self.alerts.send(alert).await {
                warn!(venue = %alert.venue_name, error = %e, "Failed to deliver operator alert");
            }
        }

        FetchResult {
            venue_id: target.id,
            media_items,
            outcome,
            report,
        }
    }

    /// Keep recent posts that have an image, newest first, up to the per-fetch limit.
    fn to_media_items(&self, target: &VenueTarget, posts: Vec<RawPost>) -> Vec<MediaItem> {
        let now = self.clock.now();
        let max_age = chrono::Duration::from_std(self.config.max_media_age)
            .unwrap_or_else(|_| chrono::Duration::hours(6));
        let oldest = now - max_age;

        posts
            .into_iter()
            .filter(|p| p.posted_at >= oldest)
            .filter_map(|p| {
                let locator = p.media_locator?;
                Some(MediaItem {
                    id: Uuid::new_v4(),
                    venue_id: target.id,
                    platform: target.platform,
                    content_hash: content_hash(target.platform, &p.post_key, &locator),
                    post_key: p.post_key,
                    posted_at: p.posted_at,
                    media_locator: locator,
                    fetched_at: now,
                })
            })
            .take(self.config.max_posts_per_fetch as usize)
            .collect()
    }
}
