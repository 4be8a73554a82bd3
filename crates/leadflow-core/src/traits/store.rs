//! Persistence collaborator for SequenceRecords.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::SequenceRecord;

/// Result of a conditional create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A record for this identity already existed; nothing was written.
    AlreadyExists,
}

/// Record store keyed by lead identity.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn get(&self, identity: &str) -> Result<Option<SequenceRecord>>;

    /// Create the record only if no record exists for its identity.
    async fn create_if_absent(&self, record: &SequenceRecord) -> Result<CreateOutcome>;

    /// Move a step from pending to scheduled.
    async fn mark_scheduled(
        &self,
        identity: &str,
        step: u8,
        template_id: &str,
        task_id: &str,
        send_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_sent(&self, identity: &str, step: u8, sent_at: DateTime<Utc>) -> Result<()>;

    /// Flag the sequence as cancelled. Returns false when no record exists.
    async fn cancel(&self, identity: &str) -> Result<bool>;
}
