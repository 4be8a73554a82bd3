//! # Leadflow Core
//!
//! Shared vocabulary for the Leadflow workspace: domain types, the
//! collaborator traits the router talks to, configuration, and the error
//! taxonomy every crate returns.

pub mod config;
pub mod error;
pub mod retry;
pub mod traits;
pub mod types;

pub use config::LeadflowConfig;
pub use error::{LeadflowError, Result};
pub use retry::RetryPolicy;
pub use types::{
    DeliveryReceipt, EmailMessage, Lead, Segment, SendRequest, SequenceRecord, StepState,
    StepStatus, SystemCounts,
};
