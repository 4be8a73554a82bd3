//! Delivery engine: the loop that claims due tasks and sends them.
//! Uses tokio::interval, so it sleeps between checks.
//!
//! Delivery is at-least-once: a task is only completed after the email
//! collaborator accepted the message.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use leadflow_core::config::EngineConfig;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::retry::RetryPolicy;
use leadflow_core::traits::{EmailSender, SequenceStore};
use leadflow_core::types::StepStatus;

use crate::persistence::SchedulerDb;
use crate::tasks::{DeliveryTask, TaskStatus};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub delivered: usize,
    /// Failed this tick, re-queued with backoff.
    pub requeued: usize,
    /// Failed for the last time.
    pub failed: usize,
    /// Belonged to a cancelled sequence.
    pub skipped: usize,
}

pub struct DeliveryEngine {
    db: Arc<SchedulerDb>,
    sender: Arc<dyn EmailSender>,
    config: EngineConfig,
    retry: RetryPolicy,
}

impl DeliveryEngine {
    pub fn new(
        db: Arc<SchedulerDb>,
        sender: Arc<dyn EmailSender>,
        config: EngineConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            sender,
            config,
            retry,
        }
    }

    /// Claim and deliver everything due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self
            .db
            .claim_due(now, self.config.batch_size)
            .map_err(LeadflowError::Database)?;
        let mut report = TickReport {
            claimed: due.len(),
            ..Default::default()
        };

        for task in due {
            match self.deliver(&task, now).await {
                Ok(outcome) => match outcome {
                    TaskStatus::Completed => report.delivered += 1,
                    TaskStatus::Skipped => report.skipped += 1,
                    TaskStatus::Failed => report.failed += 1,
                    _ => report.requeued += 1,
                },
                Err(e) => {
                    // Bookkeeping failed; put the task back so it is not stranded.
                    tracing::warn!("⚠️ Task {} bookkeeping failed: {e}", task.id);
                    let reason = e.to_string();
                    if let Err(e) = self.db.finish_task(
                        &task.id,
                        TaskStatus::Pending,
                        task.attempts,
                        Some(&reason),
                        None,
                    ) {
                        tracing::warn!("⚠️ Task {} could not be re-queued: {e}", task.id);
                    }
                    report.requeued += 1;
                }
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                "📬 Tick: {} claimed, {} delivered, {} re-queued, {} failed, {} skipped",
                report.claimed,
                report.delivered,
                report.requeued,
                report.failed,
                report.skipped
            );
        }
        Ok(report)
    }

    async fn deliver(&self, task: &DeliveryTask, now: DateTime<Utc>) -> Result<TaskStatus> {
        let record = self.db.get(&task.identity).await?;
        if record.as_ref().is_none_or(|r| r.cancelled) {
            tracing::info!(
                "⏭️ Skipping step {} for {}: sequence cancelled or missing",
                task.step,
                task.identity
            );
            self.finish(task, TaskStatus::Skipped, task.attempts, None, None)?;
            return Ok(TaskStatus::Skipped);
        }
        if record
            .as_ref()
            .and_then(|r| r.step(task.step))
            .is_some_and(|s| s.status == StepStatus::Sent)
        {
            tracing::info!("⏭️ Step {} for {} already sent", task.step, task.identity);
            self.finish(task, TaskStatus::Skipped, task.attempts, None, None)?;
            return Ok(TaskStatus::Skipped);
        }

        let message = task.request.to_message();
        let attempts = task.attempts + 1;
        match self
            .retry
            .run("email delivery", || self.sender.send(&message))
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    "✉️ Sent step {} ({}) to {} via {}",
                    task.step,
                    task.request.template_id,
                    task.identity,
                    receipt.provider
                );
                self.finish(task, TaskStatus::Completed, attempts, None, None)?;
                self.db
                    .mark_sent(&task.identity, task.step, receipt.delivered_at)
                    .await?;
                Ok(TaskStatus::Completed)
            }
            Err(e) if attempts >= self.config.max_attempts || !e.is_transient() => {
                tracing::warn!(
                    "❌ Step {} for {} failed after {attempts} attempt(s): {e}",
                    task.step,
                    task.identity
                );
                self.finish(task, TaskStatus::Failed, attempts, Some(&e.to_string()), None)?;
                Ok(TaskStatus::Failed)
            }
            Err(e) => {
                let next = now + DeliveryTask::backoff(self.config.retry_base_secs, attempts);
                tracing::warn!(
                    "⚠️ Step {} for {} failed (attempt {attempts}/{}), retry at {next}: {e}",
                    task.step,
                    task.identity,
                    self.config.max_attempts
                );
                self.finish(task, TaskStatus::Pending, attempts, Some(&e.to_string()), Some(next))?;
                Ok(TaskStatus::Pending)
            }
        }
    }

    fn finish(
        &self,
        task: &DeliveryTask,
        status: TaskStatus,
        attempts: u32,
        error: Option<&str>,
        send_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.db
            .finish_task(&task.id, status, attempts, error, send_at)
            .map_err(LeadflowError::Database)
    }
}

/// Spawn the delivery loop as a background tokio task.
pub fn spawn_engine(engine: Arc<DeliveryEngine>) -> tokio::task::JoinHandle<()> {
    let tick_secs = engine.config.tick_secs.max(1);
    tokio::spawn(async move {
        match engine.db.recover_running() {
            Ok(0) => {}
            Ok(n) => tracing::info!("♻️ Re-queued {n} task(s) left running by a previous process"),
            Err(e) => tracing::warn!("⚠️ Could not recover running tasks: {e}"),
        }
        tracing::info!("⏰ Delivery engine started (check every {tick_secs}s)");

        let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
        loop {
            interval.tick().await;
            if let Err(e) = engine.tick(Utc::now()).await {
                tracing::warn!("⚠️ Delivery tick failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use leadflow_core::traits::TaskScheduler;
    use leadflow_core::types::{
        DeliveryReceipt, EmailMessage, Lead, Segment, SendRequest, SequenceRecord, SystemCounts,
    };
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSender {
        sent: Mutex<Vec<EmailMessage>>,
        fail: bool,
        reject: bool,
    }

    #[async_trait]
    impl EmailSender for FakeSender {
        fn name(&self) -> &str {
            "fake"
        }

        async fn send(&self, message: &EmailMessage) -> Result<DeliveryReceipt> {
            if self.fail {
                return Err(LeadflowError::downstream("email", "provider 502"));
            }
            if self.reject {
                return Err(LeadflowError::Validation("email API rejected message (422)".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(DeliveryReceipt {
                provider: "fake".into(),
                message_id: None,
                delivered_at: Utc::now(),
            })
        }
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, h, 0, 0).unwrap()
    }

    async fn seeded(email: &str) -> Arc<SchedulerDb> {
        let db = Arc::new(SchedulerDb::in_memory().unwrap());
        let lead = Lead {
            email: email.into(),
            first_name: "Ash".into(),
            business_name: "Ash Auto".into(),
            assessment_score: 55,
            counts: SystemCounts::new(0, 2, 0, 1),
            weakest_systems: vec![],
            revenue_leak_total: None,
        };
        db.create_if_absent(&SequenceRecord::new(&lead, Segment::Urgent, at(0), 7))
            .await
            .unwrap();
        for step in 1..=2u8 {
            let req = SendRequest {
                identity: email.into(),
                email: email.into(),
                step,
                template_id: format!("seq-{step}"),
                variables: BTreeMap::new(),
            };
            let id = db.schedule(at(step as u32), req).await.unwrap();
            db.mark_scheduled(email, step, &format!("seq-{step}"), &id, at(step as u32))
                .await
                .unwrap();
        }
        db
    }

    fn engine(db: Arc<SchedulerDb>, sender: Arc<FakeSender>, max_attempts: u32) -> DeliveryEngine {
        DeliveryEngine::new(
            db,
            sender,
            EngineConfig {
                max_attempts,
                retry_base_secs: 60,
                ..Default::default()
            },
            RetryPolicy::none(),
        )
    }

    #[tokio::test]
    async fn test_delivers_due_tasks_and_marks_sent() {
        let db = seeded("ash@x.com").await;
        let sender = Arc::new(FakeSender::default());
        let engine = engine(db.clone(), sender.clone(), 3);

        let report = engine.tick(at(1)).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(sender.sent.lock().unwrap()[0].template_id, "seq-1");

        let record = db.get("ash@x.com").await.unwrap().unwrap();
        assert_eq!(record.step(1).unwrap().status, StepStatus::Sent);
        assert_eq!(record.step(2).unwrap().status, StepStatus::Scheduled);

        let report = engine.tick(at(5)).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(db.task_stats().unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_failure_requeues_then_fails() {
        let db = seeded("ash@x.com").await;
        let sender = Arc::new(FakeSender {
            fail: true,
            ..Default::default()
        });
        let engine = engine(db.clone(), sender, 2);

        let report = engine.tick(at(1)).await.unwrap();
        assert_eq!(report.requeued, 1);
        let task = db.tasks_for("ash@x.com").unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.send_at, at(1) + chrono::Duration::seconds(60));

        // Not due yet.
        assert_eq!(engine.tick(at(1)).await.unwrap().claimed, 0);

        let report = engine.tick(at(1) + chrono::Duration::minutes(2)).await.unwrap();
        assert_eq!(report.failed, 1);
        let task = db.tasks_for("ash@x.com").unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("email unavailable: provider 502"));
        assert!(!db.get("ash@x.com").await.unwrap().unwrap().has_sends());
    }

    #[tokio::test]
    async fn test_permanent_rejection_fails_without_requeue() {
        let db = seeded("ash@x.com").await;
        let sender = Arc::new(FakeSender {
            reject: true,
            ..Default::default()
        });
        let engine = engine(db.clone(), sender, 5);

        let report = engine.tick(at(1)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.requeued, 0);
        let task = db.tasks_for("ash@x.com").unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert_eq!(engine.tick(at(1) + chrono::Duration::hours(1)).await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn test_cancelled_sequence_is_skipped() {
        let db = seeded("ash@x.com").await;
        let sender = Arc::new(FakeSender::default());
        let engine = engine(db.clone(), sender.clone(), 3);

        // Claimed before the cancel lands: the engine re-checks the record.
        let claimed = db.claim_due(at(1), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        db.cancel("ash@x.com").await.unwrap();
        let outcome = engine.deliver(&claimed[0], at(1)).await.unwrap();
        assert_eq!(outcome, TaskStatus::Skipped);

        assert_eq!(engine.tick(at(10)).await.unwrap().claimed, 0);
        assert!(sender.sent.lock().unwrap().is_empty());
        assert_eq!(db.task_stats().unwrap().skipped, 2);
    }
}
