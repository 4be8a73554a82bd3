//! Signup intake: orchestrates guard → classify → route → schedule.
//!
//! ```text
//! RECEIVED ─┬─▶ DUPLICATE_REJECTED
//!           └─▶ CLASSIFIED ─▶ SCHEDULED ─▶ ACKNOWLEDGED
//! ```
//!
//! Payload validation happens before a `Lead` exists (see `payload`), so a
//! malformed signup never reaches classification. Steps that fail to enqueue
//! stay `pending` on the record; a retried intake resumes them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use leadflow_core::config::LeadflowConfig;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::retry::RetryPolicy;
use leadflow_core::traits::{AlertSink, CreateOutcome, SequenceStore, TaskScheduler};
use leadflow_core::types::{Lead, Segment, SequenceRecord};

use crate::classify::SegmentClassifier;
use crate::guard::{DuplicateGuard, GuardDecision};
use crate::plan::SequencePlan;
use crate::templates::TemplateRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeState {
    Received,
    DuplicateRejected,
    Classified,
    Scheduled,
    Acknowledged,
}

impl std::fmt::Display for IntakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntakeState::Received => write!(f, "RECEIVED"),
            IntakeState::DuplicateRejected => write!(f, "DUPLICATE_REJECTED"),
            IntakeState::Classified => write!(f, "CLASSIFIED"),
            IntakeState::Scheduled => write!(f, "SCHEDULED"),
            IntakeState::Acknowledged => write!(f, "ACKNOWLEDGED"),
        }
    }
}

/// Successful intake summary.
#[derive(Debug, Clone, Serialize)]
pub struct IntakeReceipt {
    pub identity: String,
    pub email: String,
    pub segment: Segment,
    /// Steps handed to the scheduler by this intake.
    pub scheduled: Vec<u8>,
    /// Steps that could not be enqueued; they stay pending for a retry.
    pub failed: Vec<u8>,
    /// True when this intake continued an existing record.
    pub resumed: bool,
    pub alerted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum IntakeOutcome {
    Accepted(IntakeReceipt),
    /// Duplicate or lost race: nothing was written.
    AlreadyProcessed {
        identity: String,
        email: String,
        segment: Segment,
        timestamp: DateTime<Utc>,
    },
}

pub struct IntakeHandler {
    classifier: SegmentClassifier,
    router: TemplateRouter,
    plan: SequencePlan,
    guard: DuplicateGuard,
    store: Arc<dyn SequenceStore>,
    scheduler: Arc<dyn TaskScheduler>,
    alerts: Arc<dyn AlertSink>,
    retry: RetryPolicy,
    campaign: String,
}

impl IntakeHandler {
    /// Build from config. Template or offset problems fail here, at startup.
    pub fn from_config(
        config: &LeadflowConfig,
        store: Arc<dyn SequenceStore>,
        scheduler: Arc<dyn TaskScheduler>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        config.classifier.validate()?;
        let router = TemplateRouter::from_config(&config.templates)?;
        let plan = SequencePlan::from_config(&config.sequence)?;
        if plan.len() != router.steps() as usize {
            return Err(LeadflowError::Config(format!(
                "sequence has {} offsets but {} templates",
                plan.len(),
                router.steps()
            )));
        }
        Ok(Self {
            classifier: SegmentClassifier::new(config.classifier),
            router,
            plan,
            guard: DuplicateGuard::new(store.clone(), config.retry.clone()),
            store,
            scheduler,
            alerts,
            retry: config.retry.clone(),
            campaign: config.campaign.clone(),
        })
    }

    pub fn campaign(&self) -> &str {
        &self.campaign
    }

    pub fn router(&self) -> &TemplateRouter {
        &self.router
    }

    pub fn classifier(&self) -> &SegmentClassifier {
        &self.classifier
    }

    pub fn store(&self) -> &Arc<dyn SequenceStore> {
        &self.store
    }

    pub async fn handle(&self, lead: Lead) -> Result<IntakeOutcome> {
        self.handle_at(lead, Utc::now()).await
    }

    /// Run one signup through the state machine with an explicit intake time.
    pub async fn handle_at(&self, lead: Lead, now: DateTime<Utc>) -> Result<IntakeOutcome> {
        let identity = lead.identity();
        tracing::info!("📥 [{}] {identity}", IntakeState::Received);

        let reservation = self.guard.check_and_reserve(&identity).await?;

        let (segment, intake_time, steps, resumed) = match reservation.decision() {
            GuardDecision::DuplicateWithSends(record) => {
                tracing::info!(
                    "🔁 [{}] {}: {} step(s) already sent",
                    IntakeState::DuplicateRejected,
                    LeadflowError::Duplicate(identity.clone()),
                    record.sent_count()
                );
                return Ok(self.already_processed(record, now));
            }
            GuardDecision::DuplicateNoSends(record) => {
                let pending = record.pending_steps();
                if pending.is_empty() {
                    tracing::info!(
                        "🔁 [{}] {}: sequence fully scheduled",
                        IntakeState::DuplicateRejected,
                        LeadflowError::Duplicate(identity.clone())
                    );
                    return Ok(self.already_processed(record, now));
                }
                tracing::info!(
                    "↪️ Resuming {identity}: {} pending step(s) of {}",
                    pending.len(),
                    record.steps.len()
                );
                (record.segment, record.created_at, pending, true)
            }
            GuardDecision::Fresh => {
                let segment = self.classifier.classify(&lead.counts);
                let record = SequenceRecord::new(&lead, segment, now, self.router.steps());
                let created = self
                    .retry
                    .run("sequence store create", || self.store.create_if_absent(&record))
                    .await?;
                if created == CreateOutcome::AlreadyExists {
                    // Another process won the conditional write.
                    tracing::warn!(
                        "🔁 [{}] {identity}: {}",
                        IntakeState::DuplicateRejected,
                        LeadflowError::RaceLost(identity.clone())
                    );
                    return Ok(IntakeOutcome::AlreadyProcessed {
                        identity,
                        email: lead.email.trim().to_string(),
                        segment,
                        timestamp: now,
                    });
                }
                (segment, now, record.pending_steps(), false)
            }
        };

        tracing::info!(
            "🏷️ [{}] {identity} → {} (priority {})",
            IntakeState::Classified,
            segment.label(),
            segment.priority()
        );

        let alerted =
            !resumed && self.router.should_alert(segment) && self.fire_alert(&lead, segment).await;

        let mut scheduled = Vec::new();
        let mut failed = Vec::new();
        for send in self
            .plan
            .build_schedule(&self.router, &lead, segment, intake_time)
            .filter(|s| steps.contains(&s.step()))
        {
            let step = send.step();
            let task = self
                .retry
                .run("task scheduler", || {
                    self.scheduler.schedule(send.send_at, send.request.clone())
                })
                .await;
            let task_id = match task {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!("⚠️ Step {step} for {identity} not scheduled: {e}");
                    failed.push(step);
                    continue;
                }
            };
            // The task is enqueued either way; a failed bookkeeping write only
            // risks an extra send if this intake is later resumed.
            if let Err(e) = self
                .retry
                .run("sequence store update", || {
                    self.store.mark_scheduled(
                        &identity,
                        step,
                        send.template_id(),
                        &task_id,
                        send.send_at,
                    )
                })
                .await
            {
                tracing::warn!(
                    "⚠️ Step {step} for {identity} enqueued as {task_id} but not recorded: {e}"
                );
            }
            scheduled.push(step);
        }

        if scheduled.is_empty() && !failed.is_empty() {
            tracing::warn!(
                "❌ No steps scheduled for {identity}; {} left pending",
                failed.len()
            );
            return Err(LeadflowError::downstream(
                "scheduler",
                format!("0 of {} steps scheduled", failed.len()),
            ));
        }

        tracing::info!(
            "📅 [{}] {identity}: {} step(s) scheduled, {} failed",
            IntakeState::Scheduled,
            scheduled.len(),
            failed.len()
        );
        drop(reservation);
        tracing::info!("✅ [{}] {identity}", IntakeState::Acknowledged);

        Ok(IntakeOutcome::Accepted(IntakeReceipt {
            identity,
            email: lead.email.trim().to_string(),
            segment,
            scheduled,
            failed,
            resumed,
            alerted,
            timestamp: now,
        }))
    }

    /// Cancel a lead's sequence (unsubscribe). Returns false if unknown.
    pub async fn cancel(&self, email: &str) -> Result<bool> {
        let identity = leadflow_core::types::normalize_identity(email);
        let cancelled = self
            .retry
            .run("sequence store cancel", || self.store.cancel(&identity))
            .await?;
        if cancelled {
            tracing::info!("🛑 Sequence cancelled for {identity}");
        }
        Ok(cancelled)
    }

    fn already_processed(&self, record: &SequenceRecord, now: DateTime<Utc>) -> IntakeOutcome {
        IntakeOutcome::AlreadyProcessed {
            identity: record.identity.clone(),
            email: record.email.clone(),
            segment: record.segment,
            timestamp: now,
        }
    }

    /// Alert failures are logged and swallowed.
    async fn fire_alert(&self, lead: &Lead, segment: Segment) -> bool {
        let who = if lead.business_name.is_empty() {
            lead.email.as_str()
        } else {
            lead.business_name.as_str()
        };
        let title = format!("{} lead: {who}", segment.label());
        let mut body = format!(
            "{} ({}) scored {}/100 with {} red, {} orange, {} yellow, {} green system(s).",
            if lead.first_name.is_empty() { "Lead" } else { lead.first_name.as_str() },
            lead.email.trim(),
            lead.assessment_score,
            lead.counts.red,
            lead.counts.orange,
            lead.counts.yellow,
            lead.counts.green,
        );
        if !lead.weakest_systems.is_empty() {
            body.push_str(&format!("\nWeakest: {}", lead.weakest_systems.join(", ")));
        }
        if let Some(total) = lead.revenue_leak_total {
            body.push_str(&format!("\nEstimated revenue leak: ${total:.0}"));
        }

        match self.alerts.alert(&title, &body).await {
            Ok(()) => {
                tracing::info!("🚨 Alert sent: {title}");
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ Alert failed for {}: {e}", lead.identity());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, RecordingAlerts, RecordingScheduler};
    use leadflow_core::types::{StepStatus, SystemCounts};
    use std::sync::atomic::Ordering;

    struct Harness {
        store: Arc<MemoryStore>,
        scheduler: Arc<RecordingScheduler>,
        alerts: Arc<RecordingAlerts>,
        handler: IntakeHandler,
    }

    fn harness_with(scheduler: RecordingScheduler, alerts: RecordingAlerts) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let scheduler = Arc::new(scheduler);
        let alerts = Arc::new(alerts);
        let mut config = LeadflowConfig::default();
        config.retry = RetryPolicy::none();
        let handler = IntakeHandler::from_config(
            &config,
            store.clone(),
            scheduler.clone(),
            alerts.clone(),
        )
        .unwrap();
        Harness {
            store,
            scheduler,
            alerts,
            handler,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingScheduler::default(), RecordingAlerts::default())
    }

    fn lead(email: &str, red: u32, orange: u32, yellow: u32, green: u32) -> Lead {
        Lead {
            email: email.into(),
            first_name: "Jo".into(),
            business_name: "Jo's Gym".into(),
            assessment_score: 48,
            counts: SystemCounts::new(red, orange, yellow, green),
            weakest_systems: vec!["Booking".into()],
            revenue_leak_total: Some(8000.0),
        }
    }

    fn accepted(outcome: IntakeOutcome) -> IntakeReceipt {
        match outcome {
            IntakeOutcome::Accepted(r) => r,
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_critical_end_to_end() {
        let h = harness();
        let now = Utc::now();
        let outcome = h.handler.handle_at(lead("a@x.com", 2, 1, 1, 0), now).await;
        let receipt = accepted(outcome.unwrap());

        assert_eq!(receipt.segment, Segment::Critical);
        assert!(receipt.alerted);
        assert_eq!(receipt.scheduled, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(receipt.failed.is_empty());
        assert_eq!(h.alerts.sent.lock().unwrap().len(), 1);

        let requests = h.scheduler.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 7);
        assert_eq!(requests[0].0, now);
        assert!(requests.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(requests[0].1.template_id, "seq-1-critical-results");

        let record = h.store.snapshot("a@x.com").unwrap();
        assert!(record.steps.iter().all(|s| s.status == StepStatus::Scheduled));
        assert_eq!(record.segment, Segment::Critical);
    }

    #[tokio::test]
    async fn test_non_critical_does_not_alert() {
        let h = harness();
        let receipt = accepted(h.handler.handle(lead("u@x.com", 0, 2, 0, 3)).await.unwrap());
        assert_eq!(receipt.segment, Segment::Urgent);
        assert!(!receipt.alerted);
        assert!(h.alerts.sent.lock().unwrap().is_empty());

        let receipt = accepted(h.handler.handle(lead("o@x.com", 0, 0, 1, 6)).await.unwrap());
        assert_eq!(receipt.segment, Segment::Optimize);
        assert!(h.alerts.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_after_send_is_noop() {
        let h = harness();
        h.handler.handle(lead("a@x.com", 1, 0, 0, 0)).await.unwrap();
        h.store
            .mark_sent("a@x.com", 1, Utc::now())
            .await
            .unwrap();

        let outcome = h.handler.handle(lead("A@X.com", 1, 0, 0, 0)).await.unwrap();
        assert!(matches!(
            outcome,
            IntakeOutcome::AlreadyProcessed { ref identity, .. } if identity == "a@x.com"
        ));
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.steps().len(), 7);
        assert_eq!(h.alerts.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fully_scheduled_duplicate_is_noop() {
        let h = harness();
        h.handler.handle(lead("a@x.com", 0, 3, 0, 0)).await.unwrap();
        let outcome = h.handler.handle(lead("a@x.com", 0, 3, 0, 0)).await.unwrap();
        assert!(matches!(outcome, IntakeOutcome::AlreadyProcessed { .. }));
        assert_eq!(h.scheduler.steps().len(), 7);
    }

    #[tokio::test]
    async fn test_partial_failure_then_resume() {
        let h = harness_with(RecordingScheduler::failing(&[3, 5]), RecordingAlerts::default());
        let first = accepted(h.handler.handle(lead("p@x.com", 1, 0, 0, 0)).await.unwrap());
        assert_eq!(first.scheduled, vec![1, 2, 4, 6, 7]);
        assert_eq!(first.failed, vec![3, 5]);
        assert_eq!(h.store.snapshot("p@x.com").unwrap().pending_steps(), vec![3, 5]);

        // Scheduler recovers; a retried webhook fills in only the gaps.
        h.scheduler.fail_steps.lock().unwrap().clear();
        let second = accepted(h.handler.handle(lead("p@x.com", 1, 0, 0, 0)).await.unwrap());
        assert!(second.resumed);
        assert!(!second.alerted);
        assert_eq!(second.scheduled, vec![3, 5]);
        assert_eq!(h.scheduler.steps(), vec![1, 2, 4, 6, 7, 3, 5]);
        assert_eq!(h.alerts.sent.lock().unwrap().len(), 1);
        assert!(h.store.snapshot("p@x.com").unwrap().pending_steps().is_empty());
    }

    #[tokio::test]
    async fn test_resume_keeps_original_cadence() {
        let h = harness_with(RecordingScheduler::failing(&[2]), RecordingAlerts::default());
        let t0 = Utc::now() - chrono::Duration::hours(2);
        h.handler.handle_at(lead("c@x.com", 0, 2, 0, 0), t0).await.unwrap();

        h.scheduler.fail_steps.lock().unwrap().clear();
        h.handler.handle(lead("c@x.com", 0, 2, 0, 0)).await.unwrap();
        let requests = h.scheduler.requests.lock().unwrap().clone();
        let (send_at, req) = requests.last().unwrap();
        assert_eq!(req.step, 2);
        assert_eq!(*send_at, t0 + chrono::Duration::hours(24));
    }

    #[tokio::test]
    async fn test_total_scheduler_failure_is_downstream_error() {
        let h = harness_with(
            RecordingScheduler::failing(&[1, 2, 3, 4, 5, 6, 7]),
            RecordingAlerts::default(),
        );
        let err = h.handler.handle(lead("z@x.com", 0, 0, 0, 1)).await.unwrap_err();
        assert!(matches!(err, LeadflowError::Downstream { .. }));
        // Record survives with everything pending so a retry can resume.
        assert_eq!(h.store.snapshot("z@x.com").unwrap().pending_steps().len(), 7);
    }

    #[tokio::test]
    async fn test_alert_failure_is_not_fatal() {
        let h = harness_with(
            RecordingScheduler::default(),
            RecordingAlerts {
                fail: true,
                ..Default::default()
            },
        );
        let receipt = accepted(h.handler.handle(lead("f@x.com", 3, 0, 0, 0)).await.unwrap());
        assert!(!receipt.alerted);
        assert_eq!(receipt.scheduled.len(), 7);
    }

    #[tokio::test]
    async fn test_concurrent_same_identity_creates_one_record() {
        let h = Arc::new(harness());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.handler.handle(lead("race@x.com", 1, 0, 0, 0)).await.unwrap()
            }));
        }
        let mut fresh = 0;
        for handle in handles {
            if let IntakeOutcome::Accepted(r) = handle.await.unwrap()
                && !r.resumed
            {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(h.store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.steps().len(), 7);
        assert_eq!(h.alerts.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_race_lost_on_conditional_create() {
        let h = harness();
        // Simulates another process creating the row between our read and write.
        struct RacingStore(Arc<MemoryStore>);
        #[async_trait::async_trait]
        impl SequenceStore for RacingStore {
            async fn get(&self, _identity: &str) -> Result<Option<SequenceRecord>> {
                Ok(None)
            }
            async fn create_if_absent(&self, _r: &SequenceRecord) -> Result<CreateOutcome> {
                Ok(CreateOutcome::AlreadyExists)
            }
            async fn mark_scheduled(
                &self,
                i: &str,
                s: u8,
                t: &str,
                id: &str,
                at: DateTime<Utc>,
            ) -> Result<()> {
                self.0.mark_scheduled(i, s, t, id, at).await
            }
            async fn mark_sent(&self, i: &str, s: u8, at: DateTime<Utc>) -> Result<()> {
                self.0.mark_sent(i, s, at).await
            }
            async fn cancel(&self, i: &str) -> Result<bool> {
                self.0.cancel(i).await
            }
        }
        let mut config = LeadflowConfig::default();
        config.retry = RetryPolicy::none();
        let handler = IntakeHandler::from_config(
            &config,
            Arc::new(RacingStore(h.store.clone())),
            h.scheduler.clone(),
            h.alerts.clone(),
        )
        .unwrap();
        let outcome = handler.handle(lead("r@x.com", 1, 0, 0, 0)).await.unwrap();
        assert!(matches!(
            outcome,
            IntakeOutcome::AlreadyProcessed {
                segment: Segment::Critical,
                ..
            }
        ));
        assert!(h.scheduler.steps().is_empty());
        assert!(h.alerts.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_blocks_future_intake() {
        let h = harness();
        assert!(!h.handler.cancel("nobody@x.com").await.unwrap());
        h.handler.handle(lead("q@x.com", 0, 0, 0, 2)).await.unwrap();
        assert!(h.handler.cancel("Q@x.com").await.unwrap());
        let outcome = h.handler.handle(lead("q@x.com", 0, 0, 0, 2)).await.unwrap();
        assert!(matches!(outcome, IntakeOutcome::AlreadyProcessed { .. }));
    }
}
