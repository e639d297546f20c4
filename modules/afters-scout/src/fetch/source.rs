use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use afters_common::VenueTarget;

use super::identity::Identity;
use crate::scheduling::FetchOutcome;

/// A post as the platform reported it, before hashing and filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPost {
    pub post_key: String,
    pub posted_at: DateTime<Utc>,
    /// Missing for posts without a retrievable image (e.g. text-only or removed).
    pub media_locator: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Blocked: {signature}")]
    Blocked { signature: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Malformed response: {0}")]
    Malformed(String),
}

const RATE_LIMIT_MARKERS: &[&str] = &["please wait a few minutes", "rate limit", "too many requests"];

impl SourceError {
    /// Map a status code and body to the error the scheduler should see.
    pub fn from_status(status: u16, body: &str) -> Self {
        let lowered = body.to_ascii_lowercase();
        if status == 429 || RATE_LIMIT_MARKERS.iter().any(|m| lowered.contains(m)) {
            return SourceError::RateLimited(format!("HTTP {status}"));
        }
        if let Some(signature) = block_signature(&lowered) {
            return SourceError::Blocked { signature };
        }
        SourceError::Status {
            status,
            body: body.chars().take(200).collect(),
        }
    }

    /// Which backoff regime this failure belongs to.
    pub fn outcome(&self) -> FetchOutcome {
        match self {
            SourceError::RateLimited(_) => FetchOutcome::RateLimited,
            SourceError::Blocked { signature } => FetchOutcome::StructuralBlock {
                signature: signature.clone(),
            },
            SourceError::Status { status, .. } if (400..500).contains(status) => {
                FetchOutcome::StructuralBlock {
                    signature: format!("http_{status}"),
                }
            }
            SourceError::Status { status, .. } => FetchOutcome::NetworkError {
                reason: format!("HTTP {status}"),
            },
            SourceError::Malformed(_) => FetchOutcome::StructuralBlock {
                signature: "malformed_payload".to_string(),
            },
            SourceError::Network(reason) => FetchOutcome::NetworkError {
                reason: reason.clone(),
            },
            SourceError::Timeout => FetchOutcome::NetworkError {
                reason: "timeout".to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout
        } else if err.is_decode() {
            SourceError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            SourceError::from_status(status.as_u16(), "")
        } else {
            SourceError::Network(err.to_string())
        }
    }
}

/// Detect a login wall or checkpoint in a lowercased response body.
pub fn block_signature(lowered: &str) -> Option<String> {
    const SIGNATURES: &[(&str, &str)] = &[
        ("checkpoint_required", "checkpoint_required"),
        ("challenge_required", "challenge_required"),
        ("login_required", "login_required"),
        ("\"require_login\":true", "login_required"),
        ("accounts/login", "login_wall"),
        ("loginform", "login_wall"),
    ];
    SIGNATURES
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, signature)| signature.to_string())
}

/// Where recent media for a venue comes from.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Recent posts at the venue's location, newest first, at most `limit`.
    async fn recent_media(
        &self,
        target: &VenueTarget,
        identity: &Identity,
        limit: u32,
    ) -> Result<Vec<RawPost>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_backoff_regimes() {
        assert_eq!(
            SourceError::from_status(429, "").outcome(),
            FetchOutcome::RateLimited
        );
        assert_eq!(
            SourceError::from_status(403, "forbidden").outcome(),
            FetchOutcome::StructuralBlock {
                signature: "http_403".into()
            }
        );
        assert!(matches!(
            SourceError::from_status(502, "bad gateway").outcome(),
            FetchOutcome::NetworkError { .. }
        ));
    }

    #[test]
    fn soft_rate_limit_message_is_a_rate_limit() {
        let err = SourceError::from_status(400, r#"{"message":"Please wait a few minutes before you try again."}"#);
        assert_eq!(err.outcome(), FetchOutcome::RateLimited);
    }

    #[test]
    fn login_wall_is_a_structural_block() {
        let err = SourceError::from_status(200, r#"<form id="loginForm" action="/accounts/login/">"#);
        assert_eq!(
            err.outcome(),
            FetchOutcome::StructuralBlock {
                signature: "login_wall".into()
            }
        );

        let err = SourceError::from_status(400, r#"{"message":"checkpoint_required"}"#);
        assert_eq!(
            err.outcome(),
            FetchOutcome::StructuralBlock {
                signature: "checkpoint_required".into()
            }
        );
    }

    #[test]
    fn timeouts_and_transport_errors_are_network_errors() {
        assert!(matches!(SourceError::Timeout.outcome(), FetchOutcome::NetworkError { .. }));
        assert!(matches!(
            SourceError::Network("reset".into()).outcome(),
            FetchOutcome::NetworkError { .. }
        ));
    }
}
