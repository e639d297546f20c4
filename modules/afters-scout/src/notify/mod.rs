//! Operator alert delivery.

mod backend;
mod noop;
mod slack;

use std::sync::Arc;

pub use backend::AlertBackend;
pub use noop::{LogBackend, NoopBackend};
pub use slack::SlackWebhook;

/// Slack when a webhook is configured, otherwise the log.
pub fn from_config(slack_webhook_url: Option<&str>) -> Arc<dyn AlertBackend> {
    match slack_webhook_url {
        Some(url) => Arc::new(SlackWebhook::new(url.to_string())),
        None => Arc::new(LogBackend),
    }
}
