use async_trait::async_trait;
use tracing::warn;

use afters_common::OperatorAlert;

use super::backend::AlertBackend;

/// Drops alerts. For tests and dry runs.
pub struct NoopBackend;

#[async_trait]
impl AlertBackend for NoopBackend {
    async fn send(&self, _alert: &OperatorAlert) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
pub struct LogBackend;

#[async_trait]
impl AlertBackend for LogBackend {
    async fn send(&self, alert: &OperatorAlert) -> anyhow::Result<()> {
        warn!(
            venue_id = %alert.venue_id,
            venue = %alert.venue_name,
            failures = alert.failure_count,
            signature = %alert.last_signature,
            rotation = alert.rotation_index,
            "OPERATOR ALERT: venue keeps hitting structural blocks"
        );
        Ok(())
    }
}
