//! Alerts: urgent out-of-band messages about high-severity leads.
//! Not persisted beyond dispatch.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// An alert about to be dispatched.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub title: String,
    pub body: String,
    /// Campaign or component that raised it.
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(title: &str, body: &str, source: &str) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Plain text rendering for chat targets.
    pub fn plain_text(&self) -> String {
        format!("🚨 {}\n\n{}", self.title, self.body)
    }
}
