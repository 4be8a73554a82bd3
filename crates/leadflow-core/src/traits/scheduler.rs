//! Scheduling collaborator: owns timed, at-least-once dispatch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::SendRequest;

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Enqueue `request` for delivery at or after `send_at`.
    /// Returns the scheduler's task id.
    async fn schedule(&self, send_at: DateTime<Utc>, request: SendRequest) -> Result<String>;
}
