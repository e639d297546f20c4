//! Read-only venue sources.

use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use afters_common::{Platform, VenueTarget};

/// Source of truth for which venues to track.
#[async_trait]
pub trait VenueRegistry: Send + Sync {
    async fn list_venues(&self) -> anyhow::Result<Vec<VenueTarget>>;
}

/// One entry of a venues file.
#[derive(Debug, Clone, Deserialize)]
pub struct VenueRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: Platform,
    #[serde(alias = "location_url", alias = "instagram_location")]
    pub location_source: String,
    #[serde(default)]
    pub priority: i32,
}

fn default_platform() -> Platform {
    Platform::Instagram
}

impl VenueRecord {
    fn into_target(self) -> VenueTarget {
        VenueTarget::new(
            self.id,
            self.name,
            self.platform,
            self.location_source,
            self.priority,
            chrono::Utc::now(),
        )
    }
}

/// Reads a JSON array of venues from disk on every poll.
pub struct JsonFileRegistry {
    path: PathBuf,
}

impl JsonFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Parse a venues file body.
pub fn parse_venues(body: &str) -> anyhow::Result<Vec<VenueTarget>> {
    let records: Vec<VenueRecord> =
        serde_json::from_str(body).context("venues file is not a JSON array of venues")?;
    Ok(records.into_iter().map(VenueRecord::into_target).collect())
}

#[async_trait]
impl VenueRegistry for JsonFileRegistry {
    async fn list_venues(&self) -> anyhow::Result<Vec<VenueTarget>> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_venues(&body)
    }
}

/// Fixed in-memory venue list.
pub struct StaticRegistry {
    venues: RwLock<Vec<VenueTarget>>,
}

impl StaticRegistry {
    pub fn new(venues: Vec<VenueTarget>) -> Self {
        Self {
            venues: RwLock::new(venues),
        }
    }

    /// Swap the venue list seen by the next `list_venues`.
    pub fn replace(&self, venues: Vec<VenueTarget>) {
        *self.venues.write().expect("lock poisoned") = venues;
    }
}

#[async_trait]
impl VenueRegistry for StaticRegistry {
    async fn list_venues(&self) -> anyhow::Result<Vec<VenueTarget>> {
        Ok(self.venues.read().expect("lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_venue_file_with_defaults_and_aliases() {
        let body = r#"[
            {
                "id": "6f1c1d9e-3c55-4f7e-9a55-0d2f8a1c2b01",
                "name": "Berghain",
                "location_url": "https://www.instagram.com/explore/locations/213385402/berghain/",
                "priority": 5
            },
            {
                "id": "0b0e7f52-41b8-4d8c-a9c3-6a5cbb9d7e02",
                "name": "Watergate",
                "platform": "instagram",
                "location_source": "224389126"
            }
        ]"#;

        let venues = parse_venues(body).unwrap();
        assert_eq!(venues.len(), 2);
        assert_eq!(venues[0].priority, 5);
        assert_eq!(venues[0].platform, Platform::Instagram);
        assert_eq!(venues[1].priority, 0);
        assert_eq!(venues[1].location_source, "224389126");
        assert!(venues[1].last_crawled_at.is_none());
    }

    #[test]
    fn rejects_entries_without_id() {
        assert!(parse_venues(r#"[{"name": "x", "location_source": "1"}]"#).is_err());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let registry = JsonFileRegistry::new("/nonexistent/venues.json");
        assert!(registry.list_venues().await.is_err());
    }
}
