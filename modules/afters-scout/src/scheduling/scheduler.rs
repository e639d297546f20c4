use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use afters_common::{BackoffState, BackoffStrategy, Clock, OperatorAlert, VenueTarget};

use super::backoff::{self, FetchOutcome, Jitter, RandomJitter};
use crate::config::SchedulerConfig;

/// Derived lifecycle phase of a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlPhase {
    /// Due now and waiting for a worker.
    Idle,
    /// Waiting for its next regular crawl.
    Scheduled,
    Fetching,
    /// Waiting out a failure delay.
    Backoff,
}

/// What the scheduler decided after a fetch outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeReport {
    pub venue_id: Uuid,
    pub delay: Duration,
    pub next_eligible_at: DateTime<Utc>,
    /// Present exactly once per structural-block streak that reaches the threshold.
    pub alert: Option<OperatorAlert>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

struct VenueEntry {
    target: VenueTarget,
    in_flight: bool,
}

struct SchedulerState {
    venues: HashMap<Uuid, VenueEntry>,
    jitter: Box<dyn Jitter>,
}

/// Decides which venue to crawl next and owns every venue's `BackoffState`.
///
/// All mutation happens under one lock, so outcome reports and eligibility
/// queries observe a consistent view.
pub struct CrawlScheduler {
    state: Mutex<SchedulerState>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
}

impl CrawlScheduler {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_jitter(config, clock, Box::new(RandomJitter))
    }

    pub fn with_jitter(config: SchedulerConfig, clock: Arc<dyn Clock>, jitter: Box<dyn Jitter>) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                venues: HashMap::new(),
                jitter,
            }),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Replace the venue set with `targets`.
    ///
    /// Known venues keep their backoff state and crawl history; only name,
    /// location and priority are refreshed. Venues missing from `targets`
    /// are dropped unless a fetch is in flight for them.
    pub fn sync_venues(&self, targets: Vec<VenueTarget>) -> SyncSummary {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut summary = SyncSummary::default();

        let incoming: std::collections::HashSet<Uuid> = targets.iter().map(|t| t.id).collect();
        let before = state.venues.len();
        state
            .venues
            .retain(|id, entry| incoming.contains(id) || entry.in_flight);
        summary.removed = before - state.venues.len();

        for target in targets {
            match state.venues.get_mut(&target.id) {
                Some(entry) => {
                    let t = &mut entry.target;
                    if t.name != target.name
                        || t.location_source != target.location_source
                        || t.priority != target.priority
                    {
                        t.name = target.name;
                        t.location_source = target.location_source;
                        t.priority = target.priority;
                        summary.updated += 1;
                    }
                }
                None => {
                    state.venues.insert(
                        target.id,
                        VenueEntry {
                            target,
                            in_flight: false,
                        },
                    );
                    summary.added += 1;
                }
            }
        }

        if summary != SyncSummary::default() {
            info!(
                added = summary.added,
                updated = summary.updated,
                removed = summary.removed,
                total = state.venues.len(),
                "Venue registry synced"
            );
        }
        summary
    }

    /// Add or replace a single venue, keeping its backoff if already known.
    pub fn upsert_venue(&self, mut target: VenueTarget) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(existing) = state.venues.get(&target.id) {
            target.backoff = existing.target.backoff.clone();
            target.last_crawled_at = existing.target.last_crawled_at;
        }
        let in_flight = state.venues.get(&target.id).is_some_and(|e| e.in_flight);
        state.venues.insert(target.id, VenueEntry { target, in_flight });
    }

    pub fn remove_venue(&self, venue_id: Uuid) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .venues
            .remove(&venue_id)
            .is_some()
    }

    pub fn venue(&self, venue_id: Uuid) -> Option<VenueTarget> {
        self.state
            .lock()
            .expect("lock poisoned")
            .venues
            .get(&venue_id)
            .map(|e| e.target.clone())
    }

    pub fn venue_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").venues.len()
    }

    /// The next venue due for a crawl, without claiming it.
    ///
    /// Among due venues the earliest `next_eligible_at` wins; ties go to the
    /// venue crawled least recently (never crawled first), then to higher
    /// priority.
    pub fn next_eligible(&self) -> Option<VenueTarget> {
        let now = self.clock.now();
        let state = self.state.lock().expect("lock poisoned");
        Self::pick(&state, now).map(|id| state.venues[&id].target.clone())
    }

    /// Like `next_eligible`, but marks the venue as fetching so no other
    /// worker picks it up until its outcome is reported.
    pub fn claim_next(&self) -> Option<VenueTarget> {
        let now = self.clock.now();
        let mut state = self.state.lock().expect("lock poisoned");
        let id = Self::pick(&state, now)?;
        let entry = state.venues.get_mut(&id)?;
        entry.in_flight = true;
        debug!(venue = %entry.target.name, "Venue claimed for crawl");
        Some(entry.target.clone())
    }

    /// Earliest moment any idle venue becomes eligible.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .venues
            .values()
            .filter(|e| !e.in_flight)
            .map(|e| e.target.backoff.next_eligible_at)
            .min()
    }

    fn pick(state: &SchedulerState, now: DateTime<Utc>) -> Option<Uuid> {
        state
            .venues
            .values()
            .filter(|e| !e.in_flight && e.target.backoff.next_eligible_at <= now)
            .min_by_key(|e| {
                let t = &e.target;
                (
                    t.backoff.next_eligible_at,
                    // None sorts before Some: never-crawled venues go first.
                    t.last_crawled_at,
                    Reverse(t.priority),
                    t.id,
                )
            })
            .map(|e| e.target.id)
    }

    /// Record how a fetch ended. Exactly one report is expected per claim.
    ///
    /// Returns `None` for venues the scheduler does not know.
    pub fn report_outcome(&self, venue_id: Uuid, outcome: &FetchOutcome) -> Option<OutcomeReport> {
        let now = self.clock.now();
        let mut guard = self.state.lock().expect("lock poisoned");
        let state = &mut *guard;

        let Some(entry) = state.venues.get_mut(&venue_id) else {
            warn!(%venue_id, outcome = outcome.label(), "Outcome reported for unknown venue");
            return None;
        };
        entry.in_flight = false;

        let target = &mut entry.target;
        target.last_crawled_at = Some(now);
        let transition =
            backoff::apply(&self.config, &mut target.backoff, outcome, now, state.jitter.as_mut());

        let alert = transition.raise_alert.then(|| OperatorAlert {
            venue_id,
            venue_name: target.name.clone(),
            failure_count: target.backoff.failure_count,
            last_signature: target.backoff.last_signature.clone().unwrap_or_default(),
            rotation_index: target.backoff.rotation_index,
            raised_at: now,
        });

        match outcome {
            FetchOutcome::Success => debug!(
                venue = %target.name,
                next_in_secs = transition.delay.as_secs(),
                "Crawl succeeded"
            ),
            _ => warn!(
                venue = %target.name,
                outcome = outcome.label(),
                failures = target.backoff.failure_count,
                delay_secs = transition.delay.as_secs(),
                rotation = target.backoff.rotation_index,
                "Crawl failed, backing off"
            ),
        }

        Some(OutcomeReport {
            venue_id,
            delay: transition.delay,
            next_eligible_at: transition.next_eligible_at,
            alert,
        })
    }

    pub fn phase(&self, venue_id: Uuid) -> Option<CrawlPhase> {
        let now = self.clock.now();
        let state = self.state.lock().expect("lock poisoned");
        let entry = state.venues.get(&venue_id)?;
        let backoff = &entry.target.backoff;
        Some(if entry.in_flight {
            CrawlPhase::Fetching
        } else if backoff.next_eligible_at <= now {
            CrawlPhase::Idle
        } else if backoff.strategy == BackoffStrategy::None {
            CrawlPhase::Scheduled
        } else {
            CrawlPhase::Backoff
        })
    }

    pub fn backoff(&self, venue_id: Uuid) -> Option<BackoffState> {
        self.state
            .lock()
            .expect("lock poisoned")
            .venues
            .get(&venue_id)
            .map(|e| e.target.backoff.clone())
    }

    pub fn in_flight_count(&self) -> usize {
        self.state
            .lock()
            .expect("lock poisoned")
            .venues
            .values()
            .filter(|e| e.in_flight)
            .count()
    }

    /// Snapshot of every venue's target and state.
    pub fn venues(&self) -> Vec<VenueTarget> {
        self.state
            .lock()
            .expect("lock poisoned")
            .venues
            .values()
            .map(|e| e.target.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::FixedJitter;
    use afters_common::{ManualClock, Platform};

    fn venue(name: &str, priority: i32, now: DateTime<Utc>) -> VenueTarget {
        VenueTarget::new(
            Uuid::new_v4(),
            name,
            Platform::Instagram,
            format!("https://www.instagram.com/explore/locations/1/{name}/"),
            priority,
            now,
        )
    }

    fn scheduler(clock: Arc<ManualClock>, jitter: f64) -> CrawlScheduler {
        CrawlScheduler::with_jitter(
            SchedulerConfig::default(),
            clock,
            Box::new(FixedJitter(jitter)),
        )
    }

    #[test]
    fn never_crawled_venue_wins_ties_then_priority() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let now = clock.now();
        let scheduler = scheduler(clock.clone(), 0.0);

        let mut crawled = venue("crawled", 10, now);
        crawled.last_crawled_at = Some(now - chrono::Duration::hours(1));
        let low = venue("low", 1, now);
        let high = venue("high", 5, now);
        let high_id = high.id;
        let low_id = low.id;
        scheduler.sync_venues(vec![crawled, low, high]);

        assert_eq!(scheduler.claim_next().map(|v| v.id), Some(high_id));
        assert_eq!(scheduler.claim_next().map(|v| v.id), Some(low_id));
        assert_eq!(scheduler.claim_next().map(|v| v.name), Some("crawled".to_string()));
        assert!(scheduler.claim_next().is_none());
    }

    #[test]
    fn longest_since_crawled_wins_ties_before_priority() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let now = clock.now();
        let scheduler = scheduler(clock.clone(), 0.0);

        let mut recent_high = venue("recent-high", 9, now);
        recent_high.last_crawled_at = Some(now - chrono::Duration::hours(1));
        let mut recent_low = venue("recent-low", 1, now);
        recent_low.last_crawled_at = Some(now - chrono::Duration::hours(1));
        let mut oldest = venue("oldest", 0, now);
        oldest.last_crawled_at = Some(now - chrono::Duration::hours(3));
        assert_eq!(oldest.backoff.next_eligible_at, recent_high.backoff.next_eligible_at);
        scheduler.sync_venues(vec![recent_low, recent_high, oldest]);

        let order: Vec<String> = std::iter::from_fn(|| scheduler.claim_next().map(|v| v.name)).collect();
        assert_eq!(order, vec!["oldest", "recent-high", "recent-low"]);
    }

    #[test]
    fn claimed_venue_is_not_handed_out_twice() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = scheduler(clock.clone(), 0.0);
        let v = venue("only", 0, clock.now());
        let id = v.id;
        scheduler.sync_venues(vec![v]);

        assert!(scheduler.claim_next().is_some());
        assert_eq!(scheduler.phase(id), Some(CrawlPhase::Fetching));
        assert!(scheduler.claim_next().is_none());
        assert!(scheduler.next_eligible().is_none());
        assert_eq!(scheduler.in_flight_count(), 1);
    }

    #[test]
    fn rate_limits_double_then_success_resets() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = scheduler(clock.clone(), 0.0);
        let v = venue("club", 0, clock.now());
        let id = v.id;
        scheduler.sync_venues(vec![v]);

        let base = scheduler.config().rate_limit_base;
        let mut delays = Vec::new();
        for _ in 0..3 {
            scheduler.claim_next().expect("venue due");
            let report = scheduler.report_outcome(id, &FetchOutcome::RateLimited).unwrap();
            assert_eq!(scheduler.phase(id), Some(CrawlPhase::Backoff));
            delays.push(report.delay);
            clock.advance(backoff::to_chrono(report.delay));
        }
        assert_eq!(delays, vec![base, base * 2, base * 4]);

        scheduler.claim_next().expect("venue due");
        let report = scheduler.report_outcome(id, &FetchOutcome::Success).unwrap();
        assert_eq!(report.delay, scheduler.config().crawl_interval);
        assert_eq!(scheduler.phase(id), Some(CrawlPhase::Scheduled));
        let state = scheduler.backoff(id).unwrap();
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.strategy, BackoffStrategy::None);
    }

    #[test]
    fn venue_in_backoff_is_not_eligible_until_delay_passes() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = scheduler(clock.clone(), 0.0);
        let v = venue("club", 0, clock.now());
        let id = v.id;
        scheduler.sync_venues(vec![v]);

        scheduler.claim_next().unwrap();
        let report = scheduler.report_outcome(id, &FetchOutcome::RateLimited).unwrap();
        assert!(scheduler.next_eligible().is_none());
        assert_eq!(scheduler.next_due_at(), Some(report.next_eligible_at));

        clock.advance(backoff::to_chrono(report.delay) - chrono::Duration::seconds(1));
        assert!(scheduler.next_eligible().is_none());
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(scheduler.next_eligible().map(|v| v.id), Some(id));
        assert_eq!(scheduler.phase(id), Some(CrawlPhase::Idle));
    }

    #[test]
    fn structural_alert_is_raised_exactly_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = scheduler(clock.clone(), 0.0);
        let v = venue("club", 0, clock.now());
        let id = v.id;
        scheduler.sync_venues(vec![v]);

        let mut alerts = Vec::new();
        for _ in 0..6 {
            scheduler.claim_next().expect("venue due");
            let report = scheduler
                .report_outcome(
                    id,
                    &FetchOutcome::StructuralBlock {
                        signature: "login_required".into(),
                    },
                )
                .unwrap();
            clock.advance(backoff::to_chrono(report.delay));
            alerts.extend(report.alert);
        }

        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.venue_id, id);
        assert_eq!(alert.failure_count, 3);
        assert_eq!(alert.last_signature, "login_required");
        assert_eq!(scheduler.backoff(id).unwrap().rotation_index, 6);
    }

    #[test]
    fn sync_keeps_backoff_for_known_venues() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = scheduler(clock.clone(), 0.0);
        let v = venue("club", 0, clock.now());
        let id = v.id;
        scheduler.sync_venues(vec![v.clone()]);

        scheduler.claim_next().unwrap();
        scheduler.report_outcome(id, &FetchOutcome::RateLimited);

        let mut renamed = v;
        renamed.name = "club (renamed)".into();
        let summary = scheduler.sync_venues(vec![renamed]);
        assert_eq!(summary.updated, 1);

        let state = scheduler.backoff(id).unwrap();
        assert_eq!(state.strategy, BackoffStrategy::RateLimited);
        assert_eq!(scheduler.venue(id).unwrap().name, "club (renamed)");

        let summary = scheduler.sync_venues(vec![]);
        assert_eq!(summary.removed, 1);
        assert_eq!(scheduler.venue_count(), 0);
    }

    #[test]
    fn unknown_venue_outcome_is_ignored() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = scheduler(clock, 0.0);
        assert!(scheduler
            .report_outcome(Uuid::new_v4(), &FetchOutcome::Success)
            .is_none());
    }
}
