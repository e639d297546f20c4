use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use afters_common::OperatorAlert;

use super::backend::AlertBackend;

/// Slack incoming webhook alert backend.
pub struct SlackWebhook {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackWebhook {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    fn format(alert: &OperatorAlert) -> String {
        format!(
            ":rotating_light: *Venue crawl blocked*\n\
             *Venue:* {} `{}`\n\
             *Consecutive blocks:* {}\n\
             *Last signature:* `{}`\n\
             *Identity slot:* {}\n\
             *Raised at:* {}\n\n\
             *Suggested action:* check the venue's location source or switch fetch backend.",
            alert.venue_name,
            alert.venue_id,
            alert.failure_count,
            alert.last_signature,
            alert.rotation_index,
            alert.raised_at.format("%Y-%m-%d %H:%M UTC"),
        )
    }
}

#[async_trait]
impl AlertBackend for SlackWebhook {
    async fn send(&self, alert: &OperatorAlert) -> anyhow::Result<()> {
        let payload = json!({
            "text": Self::format(alert),
            "unfurl_links": false,
        });

        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Slack webhook returned non-success");
            anyhow::bail!("Slack webhook returned {status}");
        }

        Ok(())
    }
}
