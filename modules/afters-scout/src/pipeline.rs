//! Wires the scout stages together: crawl, dedup, classify, score, publish.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use afters_common::{Clock, MediaItem, SystemClock, VenueScore};

use crate::classify::{ClassificationClient, WarmReport};
use crate::config::PipelineConfig;
use crate::dedup::DedupCache;
use crate::fetch::{FetchResult, FetchWorkerPool};
use crate::pulse::PulseBroadcaster;
use crate::registry::VenueRegistry;
use crate::scheduling::{CrawlScheduler, SyncSummary};
use crate::score::{Observation, ScoreAggregator};
use crate::stats::ScoutStats;
use crate::store::PulseStore;

const MEDIA_QUEUE_CAPACITY: usize = 512;
const MIN_IDLE: Duration = Duration::from_millis(10);

fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Long-lived components shared by every stage.
#[derive(Clone, TypedBuilder)]
pub struct ScoutDeps {
    pub scheduler: Arc<CrawlScheduler>,
    pub fetcher: Arc<FetchWorkerPool>,
    pub dedup: Arc<DedupCache>,
    pub classifier: Arc<ClassificationClient>,
    pub aggregator: Arc<ScoreAggregator>,
    pub broadcaster: Arc<PulseBroadcaster>,
    pub registry: Arc<dyn VenueRegistry>,
    pub store: Arc<dyn PulseStore>,
    #[builder(default)]
    pub config: PipelineConfig,
    #[builder(default = default_clock())]
    pub clock: Arc<dyn Clock>,
}

/// The venue vibe pipeline.
///
/// [`run`](Self::run) drives three concurrent loops until shutdown:
/// - crawl: claims eligible venues while fetch slots are free, dedups what
///   comes back and queues it for classification
/// - classification: assembles batches (full, or after `batch_window`),
///   classifies, feeds the aggregator and publishes forwarded scores
/// - maintenance: staleness sweeps, dedup pruning and registry polls
///
/// [`crawl_once`](Self::crawl_once) runs one pass of the same steps inline.
pub struct VibeScout {
    deps: ScoutDeps,
    totals: Mutex<ScoutStats>,
}

impl VibeScout {
    pub fn new(deps: ScoutDeps) -> Self {
        Self {
            deps,
            totals: Mutex::new(ScoutStats::default()),
        }
    }

    pub fn deps(&self) -> &ScoutDeps {
        &self.deps
    }

    /// Counters accumulated since construction.
    pub fn stats(&self) -> ScoutStats {
        self.totals.lock().expect("lock poisoned").clone()
    }

    /// Load persisted classifications into the cache and mark persisted
    /// scores as already emitted.
    pub async fn warm(&self) -> anyhow::Result<WarmReport> {
        let report = self
            .deps
            .classifier
            .cache()
            .warm(self.deps.store.as_ref())
            .await?;
        self.totals.lock().expect("lock poisoned").cache_corruptions += report.corrupt as u32;

        let scores = self.deps.store.load_scores().await?;
        let restored = scores.len();
        self.deps.aggregator.seed_emitted(scores);

        info!(
            classifications = report.loaded,
            corrupt = report.corrupt,
            scores = restored,
            "Pipeline state warmed from store"
        );
        Ok(report)
    }

    /// Reconcile the scheduler with the registry's current venue list.
    pub async fn sync_registry(&self) -> anyhow::Result<SyncSummary> {
        let venues = self.deps.registry.list_venues().await?;
        let incoming: HashSet<Uuid> = venues.iter().map(|v| v.id).collect();
        for known in self.deps.scheduler.venues() {
            if !incoming.contains(&known.id) {
                self.deps.aggregator.forget(known.id);
                self.deps.broadcaster.forget(known.id);
            }
        }
        Ok(self.deps.scheduler.sync_venues(venues))
    }

    /// One pass: fetch every eligible venue, then classify and score what
    /// was admitted. Returns this pass's counters.
    pub async fn crawl_once(&self) -> ScoutStats {
        let mut targets = Vec::new();
        while let Some(target) = self.deps.scheduler.claim_next() {
            targets.push(target);
        }
        info!(venues = targets.len(), "Crawl pass starting");

        let results =
            futures::future::join_all(targets.into_iter().map(|t| self.deps.fetcher.fetch(t))).await;

        let mut stats = ScoutStats::default();
        let mut admitted = Vec::new();
        for result in results {
            admitted.extend(self.admit_fetch(result, &mut stats));
        }
        stats.absorb(&self.classify_and_score(admitted).await);

        self.record(&stats);
        stats
    }

    /// Recompute every venue for staleness and publish what changed.
    pub async fn sweep(&self) -> usize {
        let forwarded = self.deps.aggregator.sweep();
        let count = forwarded.len();
        for score in forwarded {
            self.publish(score).await;
        }
        if count > 0 {
            debug!(scores = count, "Sweep forwarded scores");
            self.totals.lock().expect("lock poisoned").scores_forwarded += count as u32;
        }
        count
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// In-flight fetches finish and queued media is classified before
    /// returning; pending pulses are flushed.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<ScoutStats> {
        let summary = self.sync_registry().await?;
        info!(venues = summary.added, "Vibe scout started");

        let (media_tx, media_rx) = mpsc::channel(MEDIA_QUEUE_CAPACITY);
        tokio::join!(
            self.crawl_loop(media_tx, shutdown.clone()),
            self.classification_stage(media_rx),
            self.maintenance_loop(shutdown),
        );

        self.deps.broadcaster.shutdown().await;
        let totals = self.stats();
        info!("{totals}");
        Ok(totals)
    }

    async fn crawl_loop(&self, media_tx: mpsc::Sender<MediaItem>, mut shutdown: watch::Receiver<bool>) {
        let mut in_flight = FuturesUnordered::new();
        let capacity = self.deps.fetcher.capacity().max(1);

        while !*shutdown.borrow() {
            while in_flight.len() < capacity {
                match self.deps.scheduler.claim_next() {
                    Some(target) => in_flight.push(self.deps.fetcher.fetch(target)),
                    None => break,
                }
            }

            let idle = if in_flight.len() >= capacity {
                self.deps.config.max_idle
            } else {
                self.until_next_due()
            };

            tokio::select! {
                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    self.forward_fetch(result, &media_tx).await;
                }
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "Crawl loop stopping");
        while let Some(result) = in_flight.next().await {
            self.forward_fetch(result, &media_tx).await;
        }
    }

    async fn forward_fetch(&self, result: FetchResult, media_tx: &mpsc::Sender<MediaItem>) {
        let mut stats = ScoutStats::default();
        let admitted = self.admit_fetch(result, &mut stats);
        self.record(&stats);
        for item in admitted {
            let hash = item.content_hash.clone();
            if media_tx.send(item).await.is_err() {
                warn!(content_hash = %hash, "Classification stage closed, media not queued");
                self.deps.dedup.release(&hash);
            }
        }
    }

    async fn classification_stage(&self, mut media_rx: mpsc::Receiver<MediaItem>) {
        let batch_size = self.deps.classifier.batch_size();

        while let Some(first) = media_rx.recv().await {
            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + self.deps.config.batch_window;
            while batch.len() < batch_size {
                match tokio::time::timeout_at(deadline, media_rx.recv()).await {
                    Ok(Some(item)) => batch.push(item),
                    Ok(None) | Err(_) => break,
                }
            }

            let stats = self.classify_and_score(batch).await;
            self.record(&stats);
        }
        debug!("Classification stage drained");
    }

    async fn maintenance_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.deps.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut registry = tokio::time::interval(self.deps.config.registry_poll_interval);
        registry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both fire immediately; the registry was just synced by `run`.
        registry.tick().await;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = sweep.tick() => {
                    self.sweep().await;
                    self.deps.dedup.prune();
                }
                _ = registry.tick() => {
                    if let Err(e) = self.sync_registry().await {
                        warn!(error = %e, "Registry poll failed, keeping current venues");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Count a fetch and pass its media through the dedup cache.
    fn admit_fetch(&self, result: FetchResult, stats: &mut ScoutStats) -> Vec<MediaItem> {
        stats.record_outcome(&result.outcome);
        if result.report.as_ref().is_some_and(|r| r.alert.is_some()) {
            stats.alerts_raised += 1;
        }

        let fetched = result.media_items.len();
        let admitted = self.deps.dedup.admit_all(result.media_items);
        stats.media_fetched += fetched as u32;
        stats.media_duplicates += (fetched - admitted.len()) as u32;
        if fetched > 0 {
            debug!(
                venue_id = %result.venue_id,
                fetched,
                admitted = admitted.len(),
                "Media admitted"
            );
        }
        admitted
    }

    async fn classify_and_score(&self, items: Vec<MediaItem>) -> ScoutStats {
        let mut stats = ScoutStats::default();
        if items.is_empty() {
            return stats;
        }

        let batch = self.deps.classifier.classify(items).await;
        let hits = batch.cache_hits();
        stats.cache_hits = hits as u32;
        stats.classified = (batch.classified.len() - hits) as u32;
        stats.classification_dropped = batch.dropped.len() as u32;
        stats.classification_calls = batch.calls;

        // Give dropped media another chance if it shows up again.
        for dropped in &batch.dropped {
            self.deps.dedup.release(&dropped.item.content_hash);
        }
        for skipped in &batch.skipped {
            self.deps.dedup.release(&skipped.content_hash);
        }

        let touched: HashSet<Uuid> = batch.classified.iter().map(|c| c.item.venue_id).collect();
        let forwarded = self
            .deps
            .aggregator
            .ingest_batch(batch.classified.iter().map(Observation::from));
        stats.scores_forwarded = forwarded.len() as u32;
        for score in forwarded {
            self.deps.broadcaster.publish(score);
        }
        // The store keeps the latest score even when the change was too small to push.
        for venue_id in touched {
            self.persist(&self.deps.aggregator.current_score(venue_id)).await;
        }
        stats
    }

    async fn publish(&self, score: VenueScore) {
        self.persist(&score).await;
        self.deps.broadcaster.publish(score);
    }

    async fn persist(&self, score: &VenueScore) {
        if let Err(e) = self.deps.store.upsert_score(score).await {
            warn!(venue_id = %score.venue_id, error = %e, "Failed to persist venue score");
        }
    }

    fn until_next_due(&self) -> Duration {
        let max_idle = self.deps.config.max_idle;
        match self.deps.scheduler.next_due_at() {
            Some(due) => (due - self.deps.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_IDLE, max_idle.max(MIN_IDLE)),
            None => max_idle,
        }
    }

    fn record(&self, stats: &ScoutStats) {
        self.totals.lock().expect("lock poisoned").absorb(stats);
    }
}
