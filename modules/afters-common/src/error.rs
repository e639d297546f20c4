use thiserror::Error;

#[derive(Error, Debug)]
pub enum AftersError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Classification error: {0}")]
    Classification(String),

    #[error("Cache corruption for {content_hash}: {reason}")]
    CacheCorruption {
        content_hash: String,
        reason: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
