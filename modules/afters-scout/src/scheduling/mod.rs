//! Crawl scheduling: which venue to fetch next, and how long to wait after each outcome.

pub mod backoff;
mod scheduler;

pub use backoff::{FetchOutcome, FixedJitter, Jitter, RandomJitter};
pub use scheduler::{CrawlPhase, CrawlScheduler, OutcomeReport, SyncSummary};
