//! Out-of-band alert collaborator.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver a free-form alert. Callers log failures and move on.
    async fn alert(&self, title: &str, body: &str) -> Result<()>;
}

/// Alert sink that drops everything. Used when no targets are configured.
pub struct NoopAlerts;

#[async_trait]
impl AlertSink for NoopAlerts {
    async fn alert(&self, title: &str, _body: &str) -> Result<()> {
        tracing::debug!("No alert targets configured, dropping '{title}'");
        Ok(())
    }
}
