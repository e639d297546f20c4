//! Outcome-driven backoff transitions.
//!
//! Every fetch ends in exactly one `FetchOutcome`. `apply` turns that outcome
//! into the venue's next `BackoffState`:
//!
//! | outcome          | delay                                        | side effect                   |
//! |------------------|----------------------------------------------|-------------------------------|
//! | Success          | `crawl_interval`                             | failures cleared              |
//! | RateLimited      | `rate_limit_base * 2^(n-1)`, ±jitter, capped | -                             |
//! | StructuralBlock  | `structural_base * 2^(n-1)`, ±jitter, capped | rotate identity, alert at N   |
//! | NetworkError     | `network_step * n`, capped                   | -                             |
//!
//! `n` counts consecutive failures of the same kind; a different kind restarts it at 1.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use afters_common::{BackoffState, BackoffStrategy};

use crate::config::SchedulerConfig;

/// How a fetch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    RateLimited,
    /// The platform refused in a way that needs a different identity or approach.
    StructuralBlock { signature: String },
    NetworkError { reason: String },
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success => "success",
            FetchOutcome::RateLimited => "rate_limited",
            FetchOutcome::StructuralBlock { .. } => "structural_block",
            FetchOutcome::NetworkError { .. } => "network_error",
        }
    }

    fn strategy(&self) -> BackoffStrategy {
        match self {
            FetchOutcome::Success => BackoffStrategy::None,
            FetchOutcome::RateLimited => BackoffStrategy::RateLimited,
            FetchOutcome::StructuralBlock { .. } => BackoffStrategy::StructuralBlock,
            FetchOutcome::NetworkError { .. } => BackoffStrategy::NetworkRetry,
        }
    }
}

/// Multiplicative jitter source.
pub trait Jitter: Send {
    /// A factor in `[1 - ratio, 1 + ratio]`.
    fn factor(&mut self, ratio: f64) -> f64;
}

/// Uniform random jitter.
#[derive(Debug, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn factor(&mut self, ratio: f64) -> f64 {
        if ratio <= 0.0 {
            return 1.0;
        }
        1.0 + rand::rng().random_range(-ratio..=ratio)
    }
}

/// Always lands at the same point of the jitter range: -1.0 is the low edge,
/// 0.0 no jitter, 1.0 the high edge.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn factor(&mut self, ratio: f64) -> f64 {
        1.0 + ratio * self.0.clamp(-1.0, 1.0)
    }
}

/// Result of applying an outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub delay: Duration,
    pub next_eligible_at: DateTime<Utc>,
    /// True exactly once per structural-block streak, when it reaches the threshold.
    pub raise_alert: bool,
}

/// `base * 2^(failures-1)` scaled by the jitter factor, then capped once.
fn exponential(
    base: Duration,
    failures: u32,
    cap: Duration,
    ratio: f64,
    jitter: &mut dyn Jitter,
) -> Duration {
    let exponent = failures.saturating_sub(1).min(30) as i32;
    let raw = base.as_secs_f64() * 2f64.powi(exponent) * jitter.factor(ratio).max(0.0);
    let capped = raw.min(cap.as_secs_f64());
    // Millisecond resolution keeps persisted timestamps stable.
    Duration::from_millis((capped * 1000.0).round() as u64)
}

fn linear(step: Duration, failures: u32, cap: Duration) -> Duration {
    step.saturating_mul(failures.max(1)).min(cap)
}

pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Apply `outcome` to `state` at `now`.
pub fn apply(
    config: &SchedulerConfig,
    state: &mut BackoffState,
    outcome: &FetchOutcome,
    now: DateTime<Utc>,
    jitter: &mut dyn Jitter,
) -> Transition {
    let kind = outcome.strategy();

    if kind == BackoffStrategy::None {
        state.strategy = BackoffStrategy::None;
        state.failure_count = 0;
        state.last_signature = None;
        state.alert_raised = false;
        state.next_eligible_at = now + to_chrono(config.crawl_interval);
        return Transition {
            delay: config.crawl_interval,
            next_eligible_at: state.next_eligible_at,
            raise_alert: false,
        };
    }

    if state.strategy != kind {
        state.failure_count = 0;
    }
    state.strategy = kind;
    state.failure_count = state.failure_count.saturating_add(1);
    let n = state.failure_count;

    let mut raise_alert = false;
    let delay = match outcome {
        FetchOutcome::RateLimited => exponential(
            config.rate_limit_base,
            n,
            config.rate_limit_cap,
            config.jitter_ratio,
            jitter,
        ),
        FetchOutcome::StructuralBlock { signature } => {
            state.rotation_index = state.rotation_index.wrapping_add(1);
            state.last_signature = Some(signature.clone());
            if n >= config.structural_alert_threshold && !state.alert_raised {
                state.alert_raised = true;
                raise_alert = true;
            }
            exponential(
                config.structural_base,
                n,
                config.structural_cap,
                config.jitter_ratio,
                jitter,
            )
        }
        FetchOutcome::NetworkError { .. } => linear(config.network_step, n, config.network_cap),
        FetchOutcome::Success => unreachable!("handled above"),
    };

    state.next_eligible_at = now + to_chrono(delay);
    Transition {
        delay,
        next_eligible_at: state.next_eligible_at,
        raise_alert,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            crawl_interval: Duration::from_secs(600),
            rate_limit_base: Duration::from_secs(600),
            rate_limit_cap: Duration::from_secs(3600),
            jitter_ratio: 0.2,
            structural_base: Duration::from_secs(1800),
            structural_cap: Duration::from_secs(6 * 3600),
            network_step: Duration::from_secs(30),
            network_cap: Duration::from_secs(120),
            structural_alert_threshold: 3,
        }
    }

    #[test]
    fn rate_limit_doubles_then_caps() {
        let config = config();
        let now = Utc::now();
        let mut state = BackoffState::new(now);
        let mut jitter = FixedJitter(0.0);

        let delays: Vec<u64> = (0..5)
            .map(|_| {
                apply(&config, &mut state, &FetchOutcome::RateLimited, now, &mut jitter)
                    .delay
                    .as_secs()
            })
            .collect();

        assert_eq!(delays, vec![600, 1200, 2400, 3600, 3600]);
        assert_eq!(state.strategy, BackoffStrategy::RateLimited);
        assert_eq!(state.failure_count, 5);
    }

    #[test]
    fn random_jitter_stays_within_twenty_percent() {
        let config = config();
        let now = Utc::now();
        let mut jitter = RandomJitter;

        for _ in 0..200 {
            let mut state = BackoffState::new(now);
            let first = apply(&config, &mut state, &FetchOutcome::RateLimited, now, &mut jitter);
            let secs = first.delay.as_secs_f64();
            assert!((480.0..=720.0).contains(&secs), "delay {secs} outside ±20%");
        }
    }

    #[test]
    fn jittered_rate_limit_delays_still_strictly_increase() {
        let config = config();
        let now = Utc::now();
        let mut state = BackoffState::new(now);

        // Worst case: first delay at the high edge, second at the low edge.
        let first = apply(&config, &mut state, &FetchOutcome::RateLimited, now, &mut FixedJitter(1.0));
        let second = apply(&config, &mut state, &FetchOutcome::RateLimited, now, &mut FixedJitter(-1.0));
        assert!(second.delay > first.delay);
    }

    #[test]
    fn delays_keep_increasing_until_an_uneven_cap() {
        let config = SchedulerConfig {
            rate_limit_cap: Duration::from_secs(6000),
            ..config()
        };
        let now = Utc::now();
        let mut state = BackoffState::new(now);

        let edges = [1.0, 1.0, 1.0, 1.0, -1.0];
        let delays: Vec<u64> = edges
            .iter()
            .map(|&edge| {
                apply(&config, &mut state, &FetchOutcome::RateLimited, now, &mut FixedJitter(edge))
                    .delay
                    .as_secs()
            })
            .collect();

        assert_eq!(delays, vec![720, 1440, 2880, 5760, 6000]);
        assert!(delays.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn network_errors_back_off_linearly() {
        let config = config();
        let now = Utc::now();
        let mut state = BackoffState::new(now);
        let mut jitter = FixedJitter(1.0);
        let outcome = FetchOutcome::NetworkError {
            reason: "connection reset".into(),
        };

        let delays: Vec<u64> = (0..5)
            .map(|_| apply(&config, &mut state, &outcome, now, &mut jitter).delay.as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 90, 120, 120]);
        assert_eq!(state.strategy, BackoffStrategy::NetworkRetry);
    }

    #[test]
    fn switching_failure_kind_restarts_the_count() {
        let config = config();
        let now = Utc::now();
        let mut state = BackoffState::new(now);
        let mut jitter = FixedJitter(0.0);

        apply(&config, &mut state, &FetchOutcome::RateLimited, now, &mut jitter);
        apply(&config, &mut state, &FetchOutcome::RateLimited, now, &mut jitter);
        let t = apply(
            &config,
            &mut state,
            &FetchOutcome::NetworkError { reason: "timeout".into() },
            now,
            &mut jitter,
        );
        assert_eq!(state.failure_count, 1);
        assert_eq!(t.delay, Duration::from_secs(30));
    }

    #[test]
    fn structural_blocks_rotate_identity_and_alert_once() {
        let config = config();
        let now = Utc::now();
        let mut state = BackoffState::new(now);
        let mut jitter = FixedJitter(0.0);
        let block = FetchOutcome::StructuralBlock {
            signature: "login wall".into(),
        };

        let alerts: Vec<bool> = (0..5)
            .map(|_| apply(&config, &mut state, &block, now, &mut jitter).raise_alert)
            .collect();

        assert_eq!(alerts, vec![false, false, true, false, false]);
        assert_eq!(state.rotation_index, 5);
        assert_eq!(state.last_signature.as_deref(), Some("login wall"));
    }

    #[test]
    fn success_clears_failures_but_keeps_rotation() {
        let config = config();
        let now = Utc::now();
        let mut state = BackoffState::new(now);
        let mut jitter = FixedJitter(0.0);

        for _ in 0..3 {
            apply(
                &config,
                &mut state,
                &FetchOutcome::StructuralBlock { signature: "403".into() },
                now,
                &mut jitter,
            );
        }
        let t = apply(&config, &mut state, &FetchOutcome::Success, now, &mut jitter);

        assert_eq!(t.delay, config.crawl_interval);
        assert_eq!(state.strategy, BackoffStrategy::None);
        assert_eq!(state.failure_count, 0);
        assert!(!state.alert_raised);
        assert_eq!(state.rotation_index, 3);
    }
}
