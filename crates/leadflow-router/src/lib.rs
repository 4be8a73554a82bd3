//! # Leadflow Router
//!
//! The decision core: every inbound signup flows through here.
//!
//! ```text
//! SignupPayload ──validate──▶ Lead
//!   └── IntakeHandler
//!         ├── DuplicateGuard   (identity lock + persisted record)
//!         ├── SegmentClassifier (red/orange/yellow/green → Segment)
//!         ├── TemplateRouter    (segment × step → template, alert flag)
//!         └── SequencePlan      (step offsets → timed SendRequests)
//!                 └── TaskScheduler / SequenceStore / AlertSink
//! ```

pub mod classify;
pub mod guard;
pub mod intake;
pub mod payload;
pub mod plan;
pub mod templates;

#[cfg(test)]
mod testing;

pub use classify::{SegmentClassifier, classify};
pub use guard::{DuplicateGuard, GuardDecision, Reservation};
pub use intake::{IntakeHandler, IntakeOutcome, IntakeReceipt, IntakeState};
pub use payload::SignupPayload;
pub use plan::{Schedule, ScheduledSend, SequencePlan};
pub use templates::TemplateRouter;
