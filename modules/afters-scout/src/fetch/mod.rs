//! Media fetching: platform sources, identity rotation and the worker pool.

pub mod apify;
mod identity;
pub mod instagram;
mod pool;
mod source;

pub use apify::ApifyLocationSource;
pub use identity::{Identity, IdentityPool};
pub use instagram::InstagramLocationSource;
pub use pool::{FetchResult, FetchWorkerPool};
pub use source::{MediaSource, RawPost, SourceError};
