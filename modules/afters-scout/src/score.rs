//! Per-venue score aggregation over a decaying window of classifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use afters_common::{
    ClassificationResult, Clock, ContentHash, VenueScore, VenueStatus, Vibe,
};

use crate::classify::ClassifiedItem;
use crate::config::ScoreConfig;

/// A classification joined with the media facts the aggregator needs.
#[derive(Debug, Clone)]
pub struct Observation {
    pub venue_id: Uuid,
    pub posted_at: DateTime<Utc>,
    pub result: ClassificationResult,
}

impl From<&ClassifiedItem> for Observation {
    fn from(c: &ClassifiedItem) -> Self {
        Self {
            venue_id: c.item.venue_id,
            posted_at: c.item.posted_at,
            result: c.result.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct Sample {
    posted_at: DateTime<Utc>,
    energy: f64,
    crowd: f64,
    vibe: Vibe,
    confidence: f64,
    low_confidence: bool,
}

#[derive(Default)]
struct VenueWindow {
    /// One sample per content hash.
    samples: HashMap<ContentHash, Sample>,
    last_ingest_at: Option<DateTime<Utc>>,
    last_emitted: Option<VenueScore>,
}

/// Owns every venue's score. Returns a score from `ingest`/`sweep` only when
/// it changed enough to be worth pushing.
pub struct ScoreAggregator {
    venues: Mutex<HashMap<Uuid, VenueWindow>>,
    config: ScoreConfig,
    clock: Arc<dyn Clock>,
}

impl ScoreAggregator {
    pub fn new(config: ScoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            venues: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Treat previously persisted scores as already emitted, so a restart
    /// does not re-push unchanged values.
    pub fn seed_emitted(&self, scores: Vec<VenueScore>) {
        let mut venues = self.venues.lock().expect("lock poisoned");
        for score in scores {
            let window = venues.entry(score.venue_id).or_default();
            window.last_emitted = Some(score);
        }
    }

    /// Add a result and recompute its venue. Returns the new score if it
    /// should be forwarded.
    pub fn ingest(&self, obs: Observation) -> Option<VenueScore> {
        let now = self.clock.now();
        let mut venues = self.venues.lock().expect("lock poisoned");
        let window = venues.entry(obs.venue_id).or_default();
        add_sample(window, &obs, now, self.oldest(now));

        let score = self.compute(obs.venue_id, window, now);
        self.forward_if_changed(window, score)
    }

    /// Add a batch of results, recomputing each touched venue once.
    /// Returns the scores that should be forwarded.
    pub fn ingest_batch(&self, observations: impl IntoIterator<Item = Observation>) -> Vec<VenueScore> {
        let now = self.clock.now();
        let mut venues = self.venues.lock().expect("lock poisoned");
        let oldest = self.oldest(now);
        let mut touched = Vec::new();
        for obs in observations {
            add_sample(venues.entry(obs.venue_id).or_default(), &obs, now, oldest);
            if !touched.contains(&obs.venue_id) {
                touched.push(obs.venue_id);
            }
        }

        let mut forwarded = Vec::new();
        for venue_id in touched {
            if let Some(window) = venues.get_mut(&venue_id) {
                let score = self.compute(venue_id, window, now);
                forwarded.extend(self.forward_if_changed(window, score));
            }
        }
        forwarded
    }

    /// Score as of now. Venues never seen get an empty, stale score.
    pub fn current_score(&self, venue_id: Uuid) -> VenueScore {
        let now = self.clock.now();
        let mut venues = self.venues.lock().expect("lock poisoned");
        match venues.get_mut(&venue_id) {
            Some(window) => self.compute(venue_id, window, now),
            None => VenueScore::empty(venue_id, now),
        }
    }

    /// Recompute every venue against the clock. Returns scores that expired
    /// out of the window or toggled staleness since last emitted.
    pub fn sweep(&self) -> Vec<VenueScore> {
        let now = self.clock.now();
        let mut venues = self.venues.lock().expect("lock poisoned");
        let mut forwarded = Vec::new();
        for (venue_id, window) in venues.iter_mut() {
            let score = self.compute(*venue_id, window, now);
            if let Some(score) = self.forward_if_changed(window, score) {
                forwarded.push(score);
            }
        }
        forwarded
    }

    pub fn forget(&self, venue_id: Uuid) {
        self.venues.lock().expect("lock poisoned").remove(&venue_id);
    }

    fn oldest(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - to_chrono(self.config.decay_horizon)
    }

    fn compute(&self, venue_id: Uuid, window: &mut VenueWindow, now: DateTime<Utc>) -> VenueScore {
        let oldest = self.oldest(now);
        window.samples.retain(|_, s| s.posted_at >= oldest);

        let stale_after = window.last_ingest_at.unwrap_or(now) + to_chrono(self.config.stale_after);
        let sample_count = window.samples.len() as u32;
        if sample_count == 0 {
            return VenueScore {
                stale_after,
                ..VenueScore::empty(venue_id, now)
            };
        }

        let (mut energy_sum, mut crowd_sum, mut weight_sum) = (0.0, 0.0, 0.0);
        for sample in window.samples.values() {
            let w = self.weight(sample, now);
            energy_sum += w * sample.energy;
            crowd_sum += w * sample.crowd;
            weight_sum += w;
        }
        let (energy, crowd) = if weight_sum > f64::EPSILON {
            (energy_sum / weight_sum, crowd_sum / weight_sum)
        } else {
            // All weights zero: fall back to the plain mean.
            let n = sample_count as f64;
            (
                window.samples.values().map(|s| s.energy).sum::<f64>() / n,
                window.samples.values().map(|s| s.crowd).sum::<f64>() / n,
            )
        };

        VenueScore {
            venue_id,
            energy,
            crowd,
            vibe: mode_vibe(window.samples.values()),
            sample_count,
            status: VenueStatus::from_levels(energy, crowd, sample_count),
            computed_at: now,
            stale_after,
            stale: now >= stale_after,
        }
    }

    fn weight(&self, sample: &Sample, now: DateTime<Utc>) -> f64 {
        let mut w = sample.confidence;
        if sample.low_confidence {
            w *= self.config.low_confidence_weight;
        }
        if let Some(half_life) = self.config.half_life {
            let age = (now - sample.posted_at).num_milliseconds().max(0) as f64 / 1000.0;
            let half_life = half_life.as_secs_f64();
            if half_life > 0.0 {
                w *= 0.5f64.powf(age / half_life);
            }
        }
        w
    }

    fn forward_if_changed(&self, window: &mut VenueWindow, score: VenueScore) -> Option<VenueScore> {
        let changed = match &window.last_emitted {
            None => true,
            Some(prev) => {
                (score.energy - prev.energy).abs() > self.config.delta_threshold
                    || (score.crowd - prev.crowd).abs() > self.config.delta_threshold
                    || score.vibe != prev.vibe
                    || score.stale != prev.stale
            }
        };
        if changed {
            window.last_emitted = Some(score.clone());
            Some(score)
        } else {
            debug!(venue_id = %score.venue_id, "Score change below threshold, not forwarded");
            None
        }
    }
}

/// Most frequent vibe; ties go to the vibe with the most recent post.
fn mode_vibe<'a>(samples: impl Iterator<Item = &'a Sample>) -> Vibe {
    let mut tally: HashMap<Vibe, (usize, DateTime<Utc>)> = HashMap::new();
    for s in samples {
        let entry = tally.entry(s.vibe).or_insert((0, s.posted_at));
        entry.0 += 1;
        entry.1 = entry.1.max(s.posted_at);
    }
    tally
        .into_iter()
        .max_by_key(|(_, (count, latest))| (*count, *latest))
        .map(|(vibe, _)| vibe)
        .unwrap_or(Vibe::Mixed)
}

/// Insert a sample if it is new and inside the window. Only an insertion
/// counts as fresh data for staleness.
fn add_sample(window: &mut VenueWindow, obs: &Observation, now: DateTime<Utc>, oldest: DateTime<Utc>) {
    let r = &obs.result;
    if obs.posted_at < oldest || window.samples.contains_key(&r.content_hash) {
        return;
    }
    window.samples.insert(
        r.content_hash.clone(),
        Sample {
            posted_at: obs.posted_at,
            energy: r.energy as f64,
            crowd: r.crowd as f64,
            vibe: r.vibe,
            confidence: r.confidence,
            low_confidence: r.low_confidence,
        },
    );
    window.last_ingest_at = Some(now);
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use afters_common::{content_hash, ManualClock, Platform};
    use std::time::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        agg: ScoreAggregator,
        venue: Uuid,
    }

    fn harness(config: ScoreConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        Harness {
            agg: ScoreAggregator::new(config, clock.clone()),
            clock,
            venue: Uuid::new_v4(),
        }
    }

    fn flat() -> ScoreConfig {
        ScoreConfig {
            half_life: None,
            ..ScoreConfig::default()
        }
    }

    fn obs(h: &Harness, key: &str, energy: u8, crowd: u8, vibe: Vibe, confidence: f64, age_mins: i64) -> Observation {
        Observation {
            venue_id: h.venue,
            posted_at: h.clock.now() - chrono::Duration::minutes(age_mins),
            result: ClassificationResult {
                media_item_id: Uuid::new_v4(),
                content_hash: content_hash(Platform::Instagram, key, "https://cdn/x.jpg"),
                energy,
                crowd,
                vibe,
                confidence,
                low_confidence: confidence < 0.3,
                classified_at: h.clock.now(),
            },
        }
    }

    #[test]
    fn confidence_weighted_mean() {
        let h = harness(flat());
        h.agg.ingest(obs(&h, "a", 8, 6, Vibe::Techno, 0.9, 10));
        h.agg.ingest(obs(&h, "b", 2, 4, Vibe::Techno, 0.3, 10));

        let score = h.agg.current_score(h.venue);
        assert_eq!(score.sample_count, 2);
        assert!((score.energy - (8.0 * 0.9 + 2.0 * 0.3) / 1.2).abs() < 1e-9);
        assert!((score.crowd - (6.0 * 0.9 + 4.0 * 0.3) / 1.2).abs() < 1e-9);
        assert!(!score.stale);
    }

    #[test]
    fn low_confidence_counts_but_weighs_less() {
        let h = harness(flat());
        h.agg.ingest(obs(&h, "sure", 8, 8, Vibe::Hype, 0.5, 5));
        h.agg.ingest(obs(&h, "unsure", 2, 2, Vibe::Hype, 0.2, 5));

        let score = h.agg.current_score(h.venue);
        let w_low = 0.2 * 0.25;
        assert_eq!(score.sample_count, 2);
        assert!((score.energy - (8.0 * 0.5 + 2.0 * w_low) / (0.5 + w_low)).abs() < 1e-9);
    }

    #[test]
    fn results_past_the_horizon_are_excluded() {
        let h = harness(ScoreConfig {
            decay_horizon: Duration::from_secs(3 * 3600),
            ..flat()
        });
        h.agg.ingest(obs(&h, "old", 2, 2, Vibe::Chill, 0.9, 4 * 60));
        h.agg.ingest(obs(&h, "edge", 9, 9, Vibe::Techno, 0.9, 2 * 60));
        h.agg.ingest(obs(&h, "new", 7, 7, Vibe::Techno, 0.9, 5));

        let score = h.agg.current_score(h.venue);
        assert_eq!(score.sample_count, 2);
        assert!((score.energy - 8.0).abs() < 1e-9);

        h.clock.advance(chrono::Duration::minutes(61));
        let score = h.agg.current_score(h.venue);
        assert_eq!(score.sample_count, 1);
        assert!((score.energy - 7.0).abs() < 1e-9);
    }

    #[test]
    fn vibe_mode_ties_go_to_most_recent() {
        let h = harness(flat());
        h.agg.ingest(obs(&h, "a", 5, 5, Vibe::Chill, 0.9, 30));
        h.agg.ingest(obs(&h, "b", 5, 5, Vibe::Techno, 0.9, 20));
        assert_eq!(h.agg.current_score(h.venue).vibe, Vibe::Techno);

        h.agg.ingest(obs(&h, "c", 5, 5, Vibe::Chill, 0.9, 40));
        assert_eq!(h.agg.current_score(h.venue).vibe, Vibe::Chill);
    }

    #[test]
    fn small_changes_are_not_forwarded() {
        let h = harness(flat());
        assert!(h.agg.ingest(obs(&h, "a", 6, 6, Vibe::Hype, 0.8, 5)).is_some());
        assert!(h.agg.ingest(obs(&h, "b", 6, 6, Vibe::Hype, 0.8, 5)).is_none());

        let big = h.agg.ingest(obs(&h, "c", 10, 10, Vibe::Hype, 0.8, 5));
        assert!(big.is_some());
        assert_eq!(big.unwrap().sample_count, 3);
    }

    #[test]
    fn same_content_counts_once() {
        let h = harness(flat());
        h.agg.ingest(obs(&h, "a", 6, 6, Vibe::Hype, 0.8, 5));
        h.agg.ingest(obs(&h, "a", 6, 6, Vibe::Hype, 0.8, 5));
        assert_eq!(h.agg.current_score(h.venue).sample_count, 1);
    }

    #[test]
    fn sweep_forwards_staleness_toggle_once() {
        let h = harness(ScoreConfig {
            stale_after: Duration::from_secs(45 * 60),
            ..flat()
        });
        h.agg.ingest(obs(&h, "a", 6, 6, Vibe::Hype, 0.8, 5));
        assert!(h.agg.sweep().is_empty());

        h.clock.advance(chrono::Duration::minutes(46));
        let swept = h.agg.sweep();
        assert_eq!(swept.len(), 1);
        assert!(swept[0].stale);
        assert!(h.agg.sweep().is_empty());

        // Fresh data clears staleness and is forwarded.
        let fresh = h.agg.ingest(obs(&h, "b", 6, 6, Vibe::Hype, 0.8, 1)).unwrap();
        assert!(!fresh.stale);
    }

    #[test]
    fn expired_or_repeated_posts_do_not_clear_staleness() {
        let h = harness(ScoreConfig {
            decay_horizon: Duration::from_secs(3 * 3600),
            stale_after: Duration::from_secs(45 * 60),
            ..flat()
        });
        h.agg.ingest(obs(&h, "a", 6, 6, Vibe::Hype, 0.8, 60));
        h.clock.advance(chrono::Duration::minutes(50));
        assert!(h.agg.sweep()[0].stale);

        assert!(h.agg.ingest(obs(&h, "old", 9, 9, Vibe::Techno, 0.9, 240)).is_none());
        assert!(h.agg.ingest(obs(&h, "a", 6, 6, Vibe::Hype, 0.8, 110)).is_none());

        let score = h.agg.current_score(h.venue);
        assert!(score.stale);
        assert_eq!(score.sample_count, 1);
    }

    #[test]
    fn unknown_venue_has_empty_stale_score() {
        let h = harness(flat());
        let score = h.agg.current_score(Uuid::new_v4());
        assert_eq!(score.sample_count, 0);
        assert!(score.stale);
        assert_eq!(score.status, VenueStatus::InsufficientData);
    }

    #[test]
    fn recent_samples_dominate_with_half_life() {
        let h = harness(ScoreConfig {
            half_life: Some(Duration::from_secs(3600)),
            ..ScoreConfig::default()
        });
        h.agg.ingest(obs(&h, "fresh", 9, 9, Vibe::Hype, 0.8, 0));
        h.agg.ingest(obs(&h, "older", 1, 1, Vibe::Hype, 0.8, 120));

        // Weights 1.0 and 0.25 (two half-lives).
        let score = h.agg.current_score(h.venue);
        assert!((score.energy - (9.0 + 0.25) / 1.25).abs() < 1e-9);
    }

    #[test]
    fn batch_ingest_forwards_one_score_per_venue() {
        let h = harness(flat());
        let other = Uuid::new_v4();
        let mut batch = vec![
            obs(&h, "a", 7, 6, Vibe::Techno, 0.9, 5),
            obs(&h, "b", 7, 6, Vibe::Techno, 0.9, 10),
            obs(&h, "c", 7, 6, Vibe::Techno, 0.9, 15),
        ];
        let mut elsewhere = obs(&h, "d", 3, 3, Vibe::Chill, 0.9, 5);
        elsewhere.venue_id = other;
        batch.push(elsewhere);

        let forwarded = h.agg.ingest_batch(batch);

        assert_eq!(forwarded.len(), 2);
        let here = forwarded.iter().find(|s| s.venue_id == h.venue).unwrap();
        assert_eq!(here.sample_count, 3);
    }
}
