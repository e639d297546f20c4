use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use afters_common::{Clock, ContentHash, MediaItem};

use crate::config::DedupConfig;

/// Admits each piece of media at most once within the TTL.
///
/// `admit` is a single check-and-insert under the lock, so concurrent fetches
/// of the same post race to exactly one winner.
pub struct DedupCache {
    seen: Mutex<HashMap<ContentHash, DateTime<Utc>>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl DedupCache {
    pub fn new(config: &DedupConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(config.ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
            clock,
        }
    }

    /// True if this item's hash has not been admitted within the TTL; records it.
    pub fn admit(&self, item: &MediaItem) -> bool {
        let now = self.clock.now();
        let mut seen = self.seen.lock().expect("lock poisoned");
        match seen.get(&item.content_hash) {
            Some(admitted_at) if now - *admitted_at < self.ttl => {
                debug!(post_key = %item.post_key, "Duplicate media skipped");
                false
            }
            _ => {
                seen.insert(item.content_hash.clone(), now);
                true
            }
        }
    }

    /// Filter a fetch's items down to the ones seen for the first time.
    pub fn admit_all(&self, items: Vec<MediaItem>) -> Vec<MediaItem> {
        items.into_iter().filter(|item| self.admit(item)).collect()
    }

    /// Forget a hash so a later fetch can re-admit it. Used when
    /// classification dropped the item and never produced a result.
    pub fn release(&self, hash: &ContentHash) {
        self.seen.lock().expect("lock poisoned").remove(hash);
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut seen = self.seen.lock().expect("lock poisoned");
        let before = seen.len();
        seen.retain(|_, admitted_at| now - *admitted_at < self.ttl);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afters_common::{content_hash, ManualClock, Platform};
    use std::time::Duration;
    use uuid::Uuid;

    fn item(post_key: &str, clock: &ManualClock) -> MediaItem {
        let locator = format!("https://cdn.example/{post_key}.jpg");
        MediaItem {
            id: Uuid::new_v4(),
            venue_id: Uuid::new_v4(),
            platform: Platform::Instagram,
            post_key: post_key.to_string(),
            posted_at: clock.now(),
            content_hash: content_hash(Platform::Instagram, post_key, &locator),
            media_locator: locator,
            fetched_at: clock.now(),
        }
    }

    fn cache(clock: Arc<ManualClock>) -> DedupCache {
        DedupCache::new(
            &DedupConfig {
                ttl: Duration::from_secs(3600),
            },
            clock,
        )
    }

    #[test]
    fn same_hash_is_admitted_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dedup = cache(clock.clone());

        let first = item("C1", &clock);
        let mut refetched = item("C1", &clock);
        refetched.id = Uuid::new_v4();

        assert!(dedup.admit(&first));
        assert!(!dedup.admit(&refetched));
        assert!(dedup.admit(&item("C2", &clock)));
    }

    #[test]
    fn expired_hash_is_admitted_again() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dedup = cache(clock.clone());
        let media = item("C1", &clock);

        assert!(dedup.admit(&media));
        clock.advance(chrono::Duration::minutes(61));
        assert!(dedup.admit(&media));
    }

    #[test]
    fn released_hash_can_be_readmitted() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dedup = cache(clock.clone());
        let media = item("C1", &clock);

        assert!(dedup.admit(&media));
        dedup.release(&media.content_hash);
        assert!(dedup.admit(&media));
    }

    #[test]
    fn prune_drops_only_expired_entries() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dedup = cache(clock.clone());

        dedup.admit(&item("old", &clock));
        clock.advance(chrono::Duration::minutes(45));
        dedup.admit(&item("new", &clock));
        clock.advance(chrono::Duration::minutes(20));

        assert_eq!(dedup.prune(), 1);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn concurrent_admits_have_one_winner() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dedup = Arc::new(cache(clock.clone()));
        let media = item("C1", &clock);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                let media = media.clone();
                std::thread::spawn(move || dedup.admit(&media))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(winners, 1);
    }
}
