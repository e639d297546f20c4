//! Vibe classification: cached, batched, rate-limited calls to a vision service.

mod cache;
mod client;
mod limiter;
pub mod vision;

use thiserror::Error;

use ai_client::AiError;

pub use cache::{ClassificationCache, WarmReport};
pub use client::{ClassificationBatch, ClassificationClient, ClassifiedItem, DroppedItem};
pub use limiter::RateLimiter;
pub use vision::{ClaudeVisionService, HttpVisionService, VibeReading, VisionService};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassificationError {
    #[error("Classification call timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Vision service rate limited the request")]
    RateLimited,

    #[error("Vision service rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Response does not match the reading schema: {0}")]
    Schema(String),

    #[error("Expected {expected} readings, got {actual}")]
    BatchMismatch { expected: usize, actual: usize },
}

impl ClassificationError {
    /// Whether the whole batch is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClassificationError::Timeout
            | ClassificationError::Transport(_)
            | ClassificationError::RateLimited
            | ClassificationError::Schema(_)
            | ClassificationError::BatchMismatch { .. } => true,
            ClassificationError::Rejected { status, .. } => *status >= 500,
        }
    }
}

impl From<AiError> for ClassificationError {
    fn from(err: AiError) -> Self {
        match err {
            AiError::Timeout(_) => ClassificationError::Timeout,
            AiError::Network(msg) => ClassificationError::Transport(msg),
            AiError::Api { status: 429 | 529, .. } => ClassificationError::RateLimited,
            AiError::Api { status, message } => ClassificationError::Rejected { status, message },
            AiError::Parse(msg) => ClassificationError::Schema(msg),
            AiError::Config(msg) => ClassificationError::Rejected {
                status: 0,
                message: msg,
            },
        }
    }
}

impl From<reqwest::Error> for ClassificationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClassificationError::Timeout
        } else if err.is_decode() {
            ClassificationError::Schema(err.to_string())
        } else {
            ClassificationError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retried() {
        assert!(!ClassificationError::Rejected {
            status: 400,
            message: "bad image".into()
        }
        .is_retryable());
        assert!(ClassificationError::Rejected {
            status: 503,
            message: "overloaded".into()
        }
        .is_retryable());
        assert!(ClassificationError::Timeout.is_retryable());
    }

    #[test]
    fn ai_errors_map_onto_classification_errors() {
        assert_eq!(
            ClassificationError::from(AiError::Api {
                status: 429,
                message: String::new()
            }),
            ClassificationError::RateLimited
        );
        assert_eq!(ClassificationError::from(AiError::Timeout("60s".into())), ClassificationError::Timeout);
    }
}
