//! Domain types shared across the workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of emails in the follow-up sequence.
pub const SEQUENCE_LENGTH: u8 = 7;

/// Normalize an email into the identity key a SequenceRecord is stored under.
pub fn normalize_identity(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Counts of assessed systems by health color.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCounts {
    pub red: u32,
    pub orange: u32,
    pub yellow: u32,
    pub green: u32,
}

impl SystemCounts {
    pub fn new(red: u32, orange: u32, yellow: u32, green: u32) -> Self {
        Self {
            red,
            orange,
            yellow,
            green,
        }
    }
}

/// Severity tier a lead is routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Critical,
    Urgent,
    Optimize,
}

impl Segment {
    /// All segments, most severe first.
    pub const ALL: [Segment; 3] = [Segment::Critical, Segment::Urgent, Segment::Optimize];

    /// Priority rank (lower = more severe).
    pub fn priority(&self) -> u8 {
        match self {
            Segment::Critical => 1,
            Segment::Urgent => 2,
            Segment::Optimize => 3,
        }
    }

    /// Uppercase label used in responses and alerts.
    pub fn label(&self) -> &'static str {
        match self {
            Segment::Critical => "CRITICAL",
            Segment::Urgent => "URGENT",
            Segment::Optimize => "OPTIMIZE",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Segment::Critical => "At least one system is failing and leaking revenue right now",
            Segment::Urgent => "Several systems are degraded and will fail without attention",
            Segment::Optimize => "Systems are healthy overall with room to optimize",
        }
    }

    pub fn is_most_severe(&self) -> bool {
        *self == Segment::Critical
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Critical => write!(f, "critical"),
            Segment::Urgent => write!(f, "urgent"),
            Segment::Optimize => write!(f, "optimize"),
        }
    }
}

impl std::str::FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Segment::Critical),
            "urgent" => Ok(Segment::Urgent),
            "optimize" => Ok(Segment::Optimize),
            other => Err(format!("unknown segment '{other}'")),
        }
    }
}

/// A validated inbound lead. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub email: String,
    pub first_name: String,
    pub business_name: String,
    /// Assessment score, 0-100.
    pub assessment_score: u8,
    pub counts: SystemCounts,
    /// Up to two weakest-system labels, in the order submitted.
    #[serde(default)]
    pub weakest_systems: Vec<String>,
    #[serde(default)]
    pub revenue_leak_total: Option<f64>,
}

impl Lead {
    pub fn identity(&self) -> String {
        normalize_identity(&self.email)
    }

    /// Substitution variables handed to the email collaborator.
    pub fn template_variables(&self, segment: Segment) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("first_name".into(), self.first_name.clone());
        vars.insert("business_name".into(), self.business_name.clone());
        vars.insert("assessment_score".into(), self.assessment_score.to_string());
        vars.insert("segment".into(), segment.label().to_string());
        vars.insert("segment_description".into(), segment.description().to_string());
        vars.insert("red_systems".into(), self.counts.red.to_string());
        vars.insert("orange_systems".into(), self.counts.orange.to_string());
        vars.insert("yellow_systems".into(), self.counts.yellow.to_string());
        vars.insert("green_systems".into(), self.counts.green.to_string());
        for (i, label) in self.weakest_systems.iter().enumerate() {
            vars.insert(format!("weakest_system_{}", i + 1), label.clone());
        }
        if let Some(total) = self.revenue_leak_total {
            vars.insert("revenue_leak_total".into(), format!("{total:.0}"));
        }
        vars
    }
}

/// Delivery state of one sequence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not yet handed to the scheduler.
    Pending,
    /// Handed to the scheduler, not yet delivered.
    Scheduled,
    Sent,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Scheduled => "scheduled",
            StepStatus::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => StepStatus::Scheduled,
            "sent" => StepStatus::Sent,
            _ => StepStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    /// 1-based position in the sequence.
    pub step: u8,
    pub status: StepStatus,
    pub template_id: Option<String>,
    pub task_id: Option<String>,
    pub send_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub fn pending(step: u8) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            template_id: None,
            task_id: None,
            send_at: None,
            sent_at: None,
        }
    }
}

/// Persisted per-lead sequence progress. One per identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub identity: String,
    pub email: String,
    pub segment: Segment,
    pub steps: Vec<StepState>,
    pub cancelled: bool,
    /// Intake time; every step offset is relative to this.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SequenceRecord {
    /// A fresh record with every step pending.
    pub fn new(lead: &Lead, segment: Segment, created_at: DateTime<Utc>, steps: u8) -> Self {
        Self {
            identity: lead.identity(),
            email: lead.email.trim().to_string(),
            segment,
            steps: (1..=steps).map(StepState::pending).collect(),
            cancelled: false,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn sent_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Sent)
            .count()
    }

    pub fn has_sends(&self) -> bool {
        self.sent_count() > 0
    }

    /// Steps not yet handed to the scheduler, in order.
    pub fn pending_steps(&self) -> Vec<u8> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.step)
            .collect()
    }

    pub fn step(&self, step: u8) -> Option<&StepState> {
        self.steps.iter().find(|s| s.step == step)
    }
}

/// Payload handed to the scheduling collaborator for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub identity: String,
    pub email: String,
    pub step: u8,
    pub template_id: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl SendRequest {
    pub fn to_message(&self) -> EmailMessage {
        EmailMessage {
            to: self.email.clone(),
            template_id: self.template_id.clone(),
            variables: self.variables.clone(),
        }
    }
}

/// What the email collaborator is asked to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub template_id: String,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Provider that accepted the message (http, smtp, log).
    pub provider: String,
    /// Provider-side message id, when the provider returns one.
    pub message_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}
