use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Instagram location scraper types ---

/// Input for the apify/instagram-scraper actor, pointed at location pages.
#[derive(Debug, Clone, Serialize)]
pub struct InstagramLocationInput {
    #[serde(rename = "directUrls")]
    pub direct_urls: Vec<String>,
    #[serde(rename = "resultsType")]
    pub results_type: String,
    #[serde(rename = "resultsLimit")]
    pub results_limit: u32,
    #[serde(rename = "proxy", skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfiguration>,
}

/// Apify proxy selection. Switching groups changes the egress identity the
/// platform sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyConfiguration {
    #[serde(rename = "useApifyProxy")]
    pub use_apify_proxy: bool,
    #[serde(rename = "apifyProxyGroups", skip_serializing_if = "Vec::is_empty")]
    pub apify_proxy_groups: Vec<String>,
}

impl ProxyConfiguration {
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            use_apify_proxy: true,
            apify_proxy_groups: vec![name.into()],
        }
    }
}

/// A single Instagram post from the Apify dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct InstagramPost {
    pub id: Option<String>,
    #[serde(rename = "shortCode")]
    pub short_code: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "displayUrl")]
    pub display_url: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub post_type: Option<String>,
    #[serde(rename = "locationName")]
    pub location_name: Option<String>,
    /// Set by the actor when it could not load the page (login wall, block).
    pub error: Option<String>,
    #[serde(rename = "errorDescription")]
    pub error_description: Option<String>,
}

impl InstagramPost {
    /// Stable key for the post: shortcode, falling back to the numeric id.
    pub fn post_key(&self) -> Option<&str> {
        self.short_code.as_deref().or(self.id.as_deref())
    }
}

/// Wrapper for Apify API responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Apify actor run metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct RunData {
    pub id: String,
    pub status: String,
    #[serde(rename = "defaultDatasetId")]
    pub default_dataset_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
}
