use async_trait::async_trait;

use afters_common::OperatorAlert;

/// Pluggable delivery for operator alerts.
#[async_trait]
pub trait AlertBackend: Send + Sync {
    /// Deliver one alert. Callers log failures and carry on.
    async fn send(&self, alert: &OperatorAlert) -> anyhow::Result<()>;
}
