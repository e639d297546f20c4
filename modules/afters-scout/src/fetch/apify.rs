use async_trait::async_trait;
use tracing::{debug, warn};

use afters_common::VenueTarget;
use apify_client::{ApifyClient, ApifyError, InstagramPost, ProxyConfiguration};

use super::identity::Identity;
use super::source::{block_signature, MediaSource, RawPost, SourceError};

/// Fetches location pages through the Apify Instagram scraper actor.
///
/// Identity rotation maps onto Apify proxy groups: the identity's proxy
/// string names the group, and no proxy means Apify's default pool.
pub struct ApifyLocationSource {
    client: ApifyClient,
}

impl ApifyLocationSource {
    pub fn new(client: ApifyClient) -> Self {
        Self { client }
    }
}

impl From<ApifyError> for SourceError {
    fn from(err: ApifyError) -> Self {
        match err {
            ApifyError::Network(msg) => SourceError::Network(msg),
            ApifyError::Api { status, message } => SourceError::from_status(status, &message),
            ApifyError::Parse(msg) => SourceError::Malformed(msg),
            // Actor runs end FAILED or TIMED-OUT when the platform stops answering.
            ApifyError::RunFailed(status) => SourceError::Network(format!("actor run {status}")),
        }
    }
}

#[async_trait]
impl MediaSource for ApifyLocationSource {
    async fn recent_media(
        &self,
        target: &VenueTarget,
        identity: &Identity,
        limit: u32,
    ) -> Result<Vec<RawPost>, SourceError> {
        let proxy = identity.proxy.as_deref().map(ProxyConfiguration::group);
        let posts = self
            .client
            .scrape_instagram_location(&target.location_source, limit, proxy)
            .await?;
        debug!(venue = %target.name, count = posts.len(), "Apify returned posts");
        convert_posts(posts)
    }
}

/// Turn dataset items into raw posts.
///
/// The actor reports blocks as error items rather than HTTP failures; a
/// dataset holding only error items is surfaced as the corresponding failure.
pub fn convert_posts(items: Vec<InstagramPost>) -> Result<Vec<RawPost>, SourceError> {
    let mut posts = Vec::with_capacity(items.len());
    let mut first_error: Option<String> = None;

    for item in items {
        if let Some(error) = item.error.as_deref() {
            let detail = item.error_description.as_deref().unwrap_or_default();
            warn!(error, detail, "Apify item reported an error");
            first_error.get_or_insert_with(|| format!("{error} {detail}"));
            continue;
        }
        let (Some(key), Some(posted_at)) = (item.post_key(), item.timestamp) else {
            continue;
        };
        posts.push(RawPost {
            post_key: key.to_string(),
            posted_at,
            media_locator: item.display_url.clone(),
        });
    }

    if posts.is_empty() {
        if let Some(error) = first_error {
            let lowered = error.to_ascii_lowercase();
            return Err(match block_signature(&lowered) {
                Some(signature) => SourceError::Blocked { signature },
                None => SourceError::from_status(400, &error),
            });
        }
    }

    posts.sort_by(|a, b| b.posted_at.cmp(&a.posted_at));
    Ok(posts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::FetchOutcome;

    fn item(json: serde_json::Value) -> InstagramPost {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn converts_posts_and_skips_incomplete_items() {
        let posts = convert_posts(vec![
            item(serde_json::json!({
                "shortCode": "A1",
                "timestamp": "2026-03-01T22:00:00Z",
                "displayUrl": "https://cdn/a1.jpg"
            })),
            item(serde_json::json!({ "shortCode": "NO_TIME" })),
            item(serde_json::json!({
                "shortCode": "B2",
                "timestamp": "2026-03-01T23:00:00Z"
            })),
        ])
        .unwrap();

        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].post_key, "B2");
        assert_eq!(posts[0].media_locator, None);
        assert_eq!(posts[1].media_locator.as_deref(), Some("https://cdn/a1.jpg"));
    }

    #[test]
    fn error_only_dataset_surfaces_the_block() {
        let err = convert_posts(vec![item(serde_json::json!({
            "error": "restricted_page",
            "errorDescription": "Redirected to accounts/login"
        }))])
        .unwrap_err();

        assert_eq!(
            err.outcome(),
            FetchOutcome::StructuralBlock {
                signature: "login_wall".into()
            }
        );
    }

    #[test]
    fn run_failure_is_retried_as_network_error() {
        let err: SourceError = ApifyError::RunFailed("TIMED-OUT".into()).into();
        assert!(matches!(err.outcome(), FetchOutcome::NetworkError { .. }));
    }
}
