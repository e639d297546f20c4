pub mod classify;
pub mod config;
pub mod dedup;
pub mod fetch;
pub mod notify;
pub mod pipeline;
pub mod pulse;
pub mod registry;
pub mod scheduling;
pub mod score;
pub mod stats;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::ScoutConfig;
pub use pipeline::{ScoutDeps, VibeScout};
pub use stats::ScoutStats;
