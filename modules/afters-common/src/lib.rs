pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, FetchBackend, VisionBackend};
pub use error::AftersError;
pub use hash::{content_hash, ContentHash};
pub use types::*;
