//! Tunables for every pipeline stage. Each group has a `Default`; `ScoutConfig::from_env`
//! overrides individual values from the environment.

use std::time::Duration;

use afters_common::config::env_or;
use afters_common::AftersError;

/// Crawl timing and backoff.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay after a successful fetch before the venue is due again.
    pub crawl_interval: Duration,
    /// First delay after a rate limit; doubles on each consecutive one.
    pub rate_limit_base: Duration,
    pub rate_limit_cap: Duration,
    /// Uniform jitter applied to exponential delays, as a fraction (0.2 = ±20%).
    pub jitter_ratio: f64,
    /// First delay after a structural block; doubles on each consecutive one.
    pub structural_base: Duration,
    pub structural_cap: Duration,
    /// Linear step for network errors: `step * consecutive_failures`.
    pub network_step: Duration,
    pub network_cap: Duration,
    /// Consecutive structural blocks before operators are alerted.
    pub structural_alert_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            crawl_interval: Duration::from_secs(10 * 60),
            rate_limit_base: Duration::from_secs(10 * 60),
            rate_limit_cap: Duration::from_secs(2 * 60 * 60),
            jitter_ratio: 0.2,
            structural_base: Duration::from_secs(30 * 60),
            structural_cap: Duration::from_secs(6 * 60 * 60),
            network_step: Duration::from_secs(30),
            network_cap: Duration::from_secs(5 * 60),
            structural_alert_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Total in-flight fetches across all venues.
    pub max_concurrent: usize,
    pub request_timeout: Duration,
    pub max_posts_per_fetch: u32,
    /// Posts older than this are not "recent" and are skipped.
    pub max_media_age: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            request_timeout: Duration::from_secs(45),
            max_posts_per_fetch: 10,
            max_media_age: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long an admitted hash blocks re-admission.
    pub ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifyConfig {
    pub batch_size: usize,
    /// Retries after the first attempt of a batch.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub call_timeout: Duration,
    /// External calls allowed per `rate_window`.
    pub max_calls_per_window: u32,
    pub rate_window: Duration,
    pub max_concurrent_batches: usize,
    /// Results below this confidence are flagged low-confidence.
    pub confidence_threshold: f64,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            max_retries: 2,
            retry_base: Duration::from_secs(2),
            call_timeout: Duration::from_secs(60),
            max_calls_per_window: 30,
            rate_window: Duration::from_secs(60),
            max_concurrent_batches: 2,
            confidence_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoreConfig {
    /// Results whose media was posted longer ago than this are excluded.
    pub decay_horizon: Duration,
    /// A score with no new results for this long is stale.
    pub stale_after: Duration,
    /// Energy/crowd change needed before a new score is forwarded.
    pub delta_threshold: f64,
    /// Weight multiplier for low-confidence results.
    pub low_confidence_weight: f64,
    /// Within the horizon, a sample's weight halves every `half_life`.
    pub half_life: Option<Duration>,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            decay_horizon: Duration::from_secs(3 * 60 * 60),
            stale_after: Duration::from_secs(45 * 60),
            delta_threshold: 0.5,
            low_confidence_weight: 0.25,
            half_life: Some(Duration::from_secs(60 * 60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PulseConfig {
    pub coalesce_window: Duration,
    pub delivery_timeout: Duration,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_secs(2),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

/// Orchestrator cadence.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How long the classification stage waits to fill a batch.
    pub batch_window: Duration,
    pub registry_poll_interval: Duration,
    pub sweep_interval: Duration,
    /// Longest the crawl loop sleeps before re-checking eligibility.
    pub max_idle: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(1500),
            registry_poll_interval: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoutConfig {
    pub scheduler: SchedulerConfig,
    pub fetch: FetchConfig,
    pub dedup: DedupConfig,
    pub classify: ClassifyConfig,
    pub score: ScoreConfig,
    pub pulse: PulseConfig,
    pub pipeline: PipelineConfig,
}

fn secs(key: &str, default: Duration) -> Result<Duration, AftersError> {
    Ok(Duration::from_secs(env_or(key, default.as_secs())?))
}

fn millis(key: &str, default: Duration) -> Result<Duration, AftersError> {
    Ok(Duration::from_millis(env_or(
        key,
        default.as_millis() as u64,
    )?))
}

impl ScoutConfig {
    /// Defaults overridden by any of the tuning environment variables that are set.
    pub fn from_env() -> Result<Self, AftersError> {
        let d = ScoutConfig::default();

        let config = Self {
            scheduler: SchedulerConfig {
                crawl_interval: secs("CRAWL_INTERVAL_SECS", d.scheduler.crawl_interval)?,
                rate_limit_base: secs("RATE_LIMIT_BASE_SECS", d.scheduler.rate_limit_base)?,
                rate_limit_cap: secs("RATE_LIMIT_CAP_SECS", d.scheduler.rate_limit_cap)?,
                jitter_ratio: d.scheduler.jitter_ratio,
                structural_base: secs("STRUCTURAL_BASE_SECS", d.scheduler.structural_base)?,
                structural_cap: secs("STRUCTURAL_CAP_SECS", d.scheduler.structural_cap)?,
                network_step: secs("NETWORK_STEP_SECS", d.scheduler.network_step)?,
                network_cap: secs("NETWORK_CAP_SECS", d.scheduler.network_cap)?,
                structural_alert_threshold: env_or(
                    "STRUCTURAL_ALERT_THRESHOLD",
                    d.scheduler.structural_alert_threshold,
                )?,
            },
            fetch: FetchConfig {
                max_concurrent: env_or("MAX_CONCURRENT_FETCHES", d.fetch.max_concurrent)?,
                request_timeout: secs("FETCH_TIMEOUT_SECS", d.fetch.request_timeout)?,
                max_posts_per_fetch: env_or("MAX_POSTS_PER_FETCH", d.fetch.max_posts_per_fetch)?,
                max_media_age: secs("MAX_MEDIA_AGE_SECS", d.fetch.max_media_age)?,
            },
            dedup: DedupConfig {
                ttl: secs("DEDUP_TTL_SECS", d.dedup.ttl)?,
            },
            classify: ClassifyConfig {
                batch_size: env_or("CLASSIFY_BATCH_SIZE", d.classify.batch_size)?,
                max_retries: env_or("CLASSIFY_MAX_RETRIES", d.classify.max_retries)?,
                call_timeout: secs("CLASSIFY_TIMEOUT_SECS", d.classify.call_timeout)?,
                max_calls_per_window: env_or(
                    "CLASSIFY_CALLS_PER_MINUTE",
                    d.classify.max_calls_per_window,
                )?,
                confidence_threshold: env_or(
                    "CONFIDENCE_THRESHOLD",
                    d.classify.confidence_threshold,
                )?,
                ..d.classify
            },
            score: ScoreConfig {
                decay_horizon: secs("DECAY_HORIZON_SECS", d.score.decay_horizon)?,
                stale_after: secs("STALE_AFTER_SECS", d.score.stale_after)?,
                delta_threshold: env_or("SCORE_DELTA_THRESHOLD", d.score.delta_threshold)?,
                ..d.score
            },
            pulse: PulseConfig {
                coalesce_window: millis("COALESCE_WINDOW_MS", d.pulse.coalesce_window)?,
                ..d.pulse
            },
            pipeline: PipelineConfig {
                batch_window: millis("BATCH_WINDOW_MS", d.pipeline.batch_window)?,
                registry_poll_interval: secs(
                    "REGISTRY_POLL_SECS",
                    d.pipeline.registry_poll_interval,
                )?,
                sweep_interval: secs("SWEEP_INTERVAL_SECS", d.pipeline.sweep_interval)?,
                ..d.pipeline
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AftersError> {
        if self.classify.batch_size == 0 {
            return Err(AftersError::Config("CLASSIFY_BATCH_SIZE must be at least 1".into()));
        }
        if self.fetch.max_concurrent == 0 {
            return Err(AftersError::Config("MAX_CONCURRENT_FETCHES must be at least 1".into()));
        }
        if self.scheduler.structural_alert_threshold == 0 {
            return Err(AftersError::Config(
                "STRUCTURAL_ALERT_THRESHOLD must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.classify.confidence_threshold) {
            return Err(AftersError::Config("CONFIDENCE_THRESHOLD must be within 0..=1".into()));
        }
        Ok(())
    }
}
