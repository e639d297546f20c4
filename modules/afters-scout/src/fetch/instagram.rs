use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use afters_common::VenueTarget;

use super::identity::{Identity, IdentityPool};
use super::source::{block_signature, MediaSource, RawPost, SourceError};

const WEB_INFO_URL: &str = "https://www.instagram.com/api/v1/locations/web_info/";
/// Public web app id the Instagram web client sends with API calls.
const IG_APP_ID: &str = "936619743392459";

fn location_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:/locations/|^)(\d{3,})(?:/|$)").expect("valid regex"))
}

/// Numeric location id from a location page URL or a bare id.
pub fn parse_location_id(location_source: &str) -> Option<String> {
    location_id_re()
        .captures(location_source.trim())
        .map(|c| c[1].to_string())
}

/// Fetches location pages straight from Instagram's web API.
///
/// One HTTP client per identity slot, so each slot keeps its own proxy and
/// cookie-free connection pool.
pub struct InstagramLocationSource {
    clients: Vec<reqwest::Client>,
    base_url: String,
}

impl InstagramLocationSource {
    pub fn new(identities: &IdentityPool, request_timeout: Duration) -> anyhow::Result<Self> {
        let clients = (0..identities.len())
            .map(|slot| -> anyhow::Result<reqwest::Client> {
                let identity = identities.identity(slot);
                let mut builder = reqwest::Client::builder()
                    .user_agent(identity.user_agent)
                    .timeout(request_timeout);
                if let Some(proxy) = identity.proxy {
                    builder = builder.proxy(reqwest::Proxy::all(&proxy)?);
                }
                Ok(builder.build()?)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            clients,
            base_url: WEB_INFO_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl MediaSource for InstagramLocationSource {
    async fn recent_media(
        &self,
        target: &VenueTarget,
        identity: &Identity,
        limit: u32,
    ) -> Result<Vec<RawPost>, SourceError> {
        let location_id = parse_location_id(&target.location_source).ok_or_else(|| {
            SourceError::Blocked {
                signature: "invalid_location_source".to_string(),
            }
        })?;
        let client = &self.clients[identity.slot % self.clients.len()];

        debug!(venue = %target.name, location_id, slot = identity.slot, "Fetching location page");

        let resp = client
            .get(&self.base_url)
            .query(&[("location_id", location_id.as_str())])
            .header("x-ig-app-id", IG_APP_ID)
            .header("accept", "application/json")
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await?;
        if !(200..300).contains(&status) {
            return Err(SourceError::from_status(status, &body));
        }

        parse_location_posts(&body, limit)
    }
}

/// Pull recent posts out of a `web_info` response body.
pub fn parse_location_posts(body: &str, limit: u32) -> Result<Vec<RawPost>, SourceError> {
    let json: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            // A 200 with HTML instead of JSON is almost always the login wall.
            let lowered = body.to_ascii_lowercase();
            return Err(match block_signature(&lowered) {
                Some(signature) => SourceError::Blocked { signature },
                None => SourceError::Malformed(e.to_string()),
            });
        }
    };

    if json.get("status").and_then(Value::as_str) == Some("fail") {
        let message = json
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(SourceError::from_status(400, message));
    }

    let location = json
        .get("native_location_data")
        .ok_or_else(|| SourceError::Malformed("missing native_location_data".into()))?;

    // Recent first; ranked only fills in what recent lacks.
    let mut medias = Vec::new();
    for tab in ["recent", "ranked"] {
        if let Some(section) = location.get(tab) {
            collect_medias(section, &mut medias);
        }
    }

    let mut seen = HashSet::new();
    let mut posts: Vec<RawPost> = medias
        .into_iter()
        .filter_map(raw_post)
        .filter(|p| seen.insert(p.post_key.clone()))
        .collect();
    posts.sort_by(|a, b| b.posted_at.cmp(&a.posted_at));
    posts.truncate(limit as usize);
    Ok(posts)
}

fn collect_medias<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if map.contains_key("code") && map.contains_key("taken_at") {
                out.push(value);
                return;
            }
            for child in map.values() {
                collect_medias(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_medias(child, out);
            }
        }
        _ => {}
    }
}

fn raw_post(media: &Value) -> Option<RawPost> {
    let post_key = media.get("code")?.as_str()?.to_string();
    let taken_at = media.get("taken_at")?.as_i64()?;
    let posted_at = DateTime::<Utc>::from_timestamp(taken_at, 0)?;

    // Carousels keep their cover image on the first child.
    let image_source = media
        .get("carousel_media")
        .and_then(|c| c.get(0))
        .unwrap_or(media);
    let media_locator = image_source
        .pointer("/image_versions2/candidates/0/url")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(RawPost {
        post_key,
        posted_at,
        media_locator,
    })
}
