//! Collaborator traits. The router only ever talks to these; concrete
//! backends live in the scheduler, channels, and security crates.

pub mod alert;
pub mod email;
pub mod scheduler;
pub mod secrets;
pub mod store;

pub use alert::{AlertSink, NoopAlerts};
pub use email::EmailSender;
pub use scheduler::TaskScheduler;
pub use secrets::SecretSource;
pub use store::{CreateOutcome, SequenceStore};
