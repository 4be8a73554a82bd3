//! Delivery tasks, one timed email send per sequence step.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::types::SendRequest;

/// A queued email send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub id: String,
    /// Normalized lead identity the send belongs to.
    pub identity: String,
    pub step: u8,
    /// Earliest time the engine may deliver. Pushed back on retry.
    pub send_at: DateTime<Utc>,
    pub request: SendRequest,
    pub status: TaskStatus,
    /// Delivery attempts made so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// The sequence was cancelled before this step went out.
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "skipped" => TaskStatus::Skipped,
            _ => TaskStatus::Pending,
        }
    }
}

impl DeliveryTask {
    pub fn new(send_at: DateTime<Utc>, request: SendRequest) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            identity: request.identity.clone(),
            step: request.step,
            send_at,
            request,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.send_at <= now
    }

    /// Re-queue delay after `attempts` failures: `base * 2^(attempts-1)`.
    pub fn backoff(base_secs: u64, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        let secs = base_secs.saturating_mul(1u64 << exp).min(i64::MAX as u64 / 1000);
        Duration::seconds(secs as i64)
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}
