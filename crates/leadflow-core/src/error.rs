//! Leadflow error taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LeadflowError>;

#[derive(Debug, Error)]
pub enum LeadflowError {
    /// Malformed inbound payload. Reported to the caller, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The lead already has a sequence in progress. Soft: not a failure.
    #[error("Duplicate signup: {0}")]
    Duplicate(String),

    /// Missing template mapping, bad offset table, unreadable config file.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A collaborator (store, scheduler, email, alert) could not be reached.
    #[error("{collaborator} unavailable: {reason}")]
    Downstream {
        collaborator: &'static str,
        reason: String,
    },

    /// Another concurrent request reserved this identity first.
    #[error("Reservation lost for {0}")]
    RaceLost(String),

    #[error("Missing secret: {0}")]
    MissingSecret(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LeadflowError {
    pub fn downstream(collaborator: &'static str, reason: impl Into<String>) -> Self {
        Self::Downstream {
            collaborator,
            reason: reason.into(),
        }
    }

    /// Transient failures worth retrying with backoff. Everything else is
    /// deterministic (bad input, bad config) and retrying cannot help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Downstream { .. } | Self::Database(_) | Self::Io(_)
        )
    }

    /// Duplicates and lost races get the same soft "already processed" answer.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_) | Self::RaceLost(_))
    }
}
