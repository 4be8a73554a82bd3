//! # Leadflow Scheduler
//!
//! Durable side of the sequencing pipeline: where sequence records live, how
//! timed sends are queued and delivered, and where urgent alerts go.
//!
//! ## Architecture
//! ```text
//! IntakeHandler
//!   ├── SequenceStore  ──▶ SchedulerDb (sequence_records, sequence_steps)
//!   ├── TaskScheduler  ──▶ SchedulerDb (delivery_tasks)
//!   └── AlertSink      ──▶ AlertDispatcher
//!                            ├── Slack (incoming webhook)
//!                            ├── Discord (webhook)
//!                            ├── Telegram (sendMessage)
//!                            └── Webhook (HTTP POST)
//!
//! DeliveryEngine (tokio interval)
//!   ├── claim due tasks → EmailSender
//!   ├── success → mark step sent
//!   └── failure → re-queue with backoff, then failed
//! ```

pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod tasks;

pub use dispatch::{AlertDispatcher, AlertTarget, targets_from_config};
pub use engine::{DeliveryEngine, TickReport, spawn_engine};
pub use notify::Alert;
pub use persistence::SchedulerDb;
pub use tasks::{DeliveryTask, TaskStats, TaskStatus};
