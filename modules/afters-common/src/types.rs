use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::ContentHash;

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Instagram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The musical/social character of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Vibe {
    Techno,
    Chill,
    Hype,
    Mixed,
}

impl Vibe {
    pub const ALL: [Vibe; 4] = [Vibe::Techno, Vibe::Chill, Vibe::Hype, Vibe::Mixed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Vibe::Techno => "Techno",
            Vibe::Chill => "Chill",
            Vibe::Hype => "Hype",
            Vibe::Mixed => "Mixed",
        }
    }
}

impl std::fmt::Display for Vibe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Vibe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Vibe::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown vibe: {s}"))
    }
}

/// Coarse read of how busy a venue is right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueStatus {
    Live,
    WarmingUp,
    Dead,
    InsufficientData,
}

impl VenueStatus {
    pub fn from_levels(energy: f64, crowd: f64, sample_count: u32) -> Self {
        if sample_count == 0 {
            VenueStatus::InsufficientData
        } else if energy >= 7.0 && crowd >= 7.0 {
            VenueStatus::Live
        } else if energy >= 5.0 || crowd >= 5.0 {
            VenueStatus::WarmingUp
        } else {
            VenueStatus::Dead
        }
    }
}

impl std::fmt::Display for VenueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VenueStatus::Live => write!(f, "live"),
            VenueStatus::WarmingUp => write!(f, "warming_up"),
            VenueStatus::Dead => write!(f, "dead"),
            VenueStatus::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

/// Which backoff regime a venue is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    None,
    RateLimited,
    StructuralBlock,
    NetworkRetry,
}

// --- Venues ---

/// Per-venue crawl timing state. Only the scheduler mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffState {
    pub strategy: BackoffStrategy,
    /// Consecutive failures under the current strategy.
    pub failure_count: u32,
    pub next_eligible_at: DateTime<Utc>,
    /// Selects the user-agent/proxy identity slot.
    pub rotation_index: usize,
    pub last_signature: Option<String>,
    /// Set once the structural-block alert fired; cleared by a success.
    pub alert_raised: bool,
}

impl BackoffState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            strategy: BackoffStrategy::None,
            failure_count: 0,
            next_eligible_at: now,
            rotation_index: 0,
            last_signature: None,
            alert_raised: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueTarget {
    pub id: Uuid,
    pub name: String,
    pub platform: Platform,
    /// Platform-side location identifier, e.g. an Instagram location URL.
    pub location_source: String,
    /// Higher goes first when timing ties.
    pub priority: i32,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub backoff: BackoffState,
}

impl VenueTarget {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        platform: Platform,
        location_source: impl Into<String>,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            platform,
            location_source: location_source.into(),
            priority,
            last_crawled_at: None,
            backoff: BackoffState::new(now),
        }
    }
}

// --- Media ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub platform: Platform,
    /// Platform post key (Instagram shortcode).
    pub post_key: String,
    pub posted_at: DateTime<Utc>,
    /// Where the image can be retrieved from.
    pub media_locator: String,
    pub content_hash: ContentHash,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// The media item that was sent for classification.
    pub media_item_id: Uuid,
    pub content_hash: ContentHash,
    pub energy: u8,
    pub crowd: u8,
    pub vibe: Vibe,
    pub confidence: f64,
    /// Below the configured confidence threshold; counted with reduced weight.
    pub low_confidence: bool,
    pub classified_at: DateTime<Utc>,
}

// --- Scores ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueScore {
    pub venue_id: Uuid,
    pub energy: f64,
    pub crowd: f64,
    pub vibe: Vibe,
    pub sample_count: u32,
    pub status: VenueStatus,
    pub computed_at: DateTime<Utc>,
    pub stale_after: DateTime<Utc>,
    pub stale: bool,
}

impl VenueScore {
    /// Score for a venue with nothing in its window.
    pub fn empty(venue_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            venue_id,
            energy: 0.0,
            crowd: 0.0,
            vibe: Vibe::Mixed,
            sample_count: 0,
            status: VenueStatus::InsufficientData,
            computed_at: now,
            stale_after: now,
            stale: true,
        }
    }
}

/// Payload pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulseDelta {
    pub venue_id: Uuid,
    pub energy: f64,
    pub crowd: f64,
    pub vibe: Vibe,
    pub sample_count: u32,
    pub computed_at: DateTime<Utc>,
    pub stale: bool,
}

impl From<&VenueScore> for PulseDelta {
    fn from(score: &VenueScore) -> Self {
        Self {
            venue_id: score.venue_id,
            energy: score.energy,
            crowd: score.crowd,
            vibe: score.vibe,
            sample_count: score.sample_count,
            computed_at: score.computed_at,
            stale: score.stale,
        }
    }
}

// --- Operator signals ---

/// Raised when a venue keeps hitting structural blocks. Needs a human (or an
/// external automation) to change the fetch strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub venue_id: Uuid,
    pub venue_name: String,
    pub failure_count: u32,
    pub last_signature: String,
    pub rotation_index: usize,
    pub raised_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vibe_parses_case_insensitively() {
        assert_eq!("techno".parse::<Vibe>(), Ok(Vibe::Techno));
        assert_eq!(" HYPE ".parse::<Vibe>(), Ok(Vibe::Hype));
        assert!("Dark".parse::<Vibe>().is_err());
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(VenueStatus::from_levels(8.0, 7.5, 4), VenueStatus::Live);
        assert_eq!(VenueStatus::from_levels(8.0, 3.0, 4), VenueStatus::WarmingUp);
        assert_eq!(VenueStatus::from_levels(2.0, 3.0, 4), VenueStatus::Dead);
        assert_eq!(
            VenueStatus::from_levels(9.0, 9.0, 0),
            VenueStatus::InsufficientData
        );
    }

    #[test]
    fn pulse_delta_serializes_camel_case() {
        let score = VenueScore::empty(Uuid::new_v4(), Utc::now());
        let json = serde_json::to_value(PulseDelta::from(&score)).unwrap();
        assert!(json.get("venueId").is_some());
        assert!(json.get("sampleCount").is_some());
        assert_eq!(json["stale"], serde_json::Value::Bool(true));
        assert_eq!(json["vibe"], "Mixed");
    }
}
