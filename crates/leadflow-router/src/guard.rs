//! Duplicate guard: identity-scoped check-and-reserve.
//!
//! The record read and everything the caller does with the answer (create,
//! schedule) happen while the identity's lock is held, so for one identity only
//! a single concurrent caller ever observes `Fresh`. The store's conditional
//! create backs this up across processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use leadflow_core::error::Result;
use leadflow_core::retry::RetryPolicy;
use leadflow_core::traits::SequenceStore;
use leadflow_core::types::SequenceRecord;

/// What the persisted state says about an incoming identity.
#[derive(Debug, Clone)]
pub enum GuardDecision {
    /// No record: create one and schedule the full sequence.
    Fresh,
    /// Record exists but nothing was sent yet: schedule only pending steps.
    DuplicateNoSends(SequenceRecord),
    /// At least one email went out (or the lead unsubscribed): do nothing.
    DuplicateWithSends(SequenceRecord),
}

impl GuardDecision {
    pub fn label(&self) -> &'static str {
        match self {
            GuardDecision::Fresh => "fresh",
            GuardDecision::DuplicateNoSends(_) => "duplicate_no_sends",
            GuardDecision::DuplicateWithSends(_) => "duplicate_with_sends",
        }
    }
}

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

pub struct DuplicateGuard {
    store: Arc<dyn SequenceStore>,
    locks: LockTable,
    retry: RetryPolicy,
}

/// Held for the duration of one intake. Dropping it releases the identity.
pub struct Reservation {
    identity: String,
    decision: GuardDecision,
    lock: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl Reservation {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn decision(&self) -> &GuardDecision {
        &self.decision
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // Release the identity first, then forget the lock if nobody is waiting.
        self.lock.take();
        if let Ok(mut table) = self.locks.lock()
            && table
                .get(&self.identity)
                .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            table.remove(&self.identity);
        }
    }
}

impl DuplicateGuard {
    pub fn new(store: Arc<dyn SequenceStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
            retry,
        }
    }

    /// Lock the identity, read its record, and classify the intake.
    pub async fn check_and_reserve(&self, identity: &str) -> Result<Reservation> {
        let lock = self.identity_lock(identity);
        let held = lock.lock_owned().await;

        // Build the reservation before the read so a failed read still releases.
        let mut reservation = Reservation {
            identity: identity.to_string(),
            decision: GuardDecision::Fresh,
            lock: Some(held),
            locks: self.locks.clone(),
        };

        let record = self
            .retry
            .run("sequence store read", || self.store.get(identity))
            .await?;

        reservation.decision = match record {
            None => GuardDecision::Fresh,
            Some(r) if r.cancelled || r.has_sends() => GuardDecision::DuplicateWithSends(r),
            Some(r) => GuardDecision::DuplicateNoSends(r),
        };
        tracing::debug!(
            "Guard decision for {identity}: {}",
            reservation.decision.label()
        );
        Ok(reservation)
    }

    /// Number of identities currently locked or awaited.
    pub fn active_identities(&self) -> usize {
        self.locks.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn identity_lock(&self, identity: &str) -> Arc<AsyncMutex<()>> {
        let mut table = match self.locks.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        table
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use chrono::Utc;
    use leadflow_core::types::{Lead, Segment, StepStatus, SystemCounts};
    use std::time::Duration;

    fn record(email: &str) -> SequenceRecord {
        let lead = Lead {
            email: email.into(),
            first_name: "Kim".into(),
            business_name: "Kim Dental".into(),
            assessment_score: 70,
            counts: SystemCounts::new(0, 0, 2, 5),
            weakest_systems: vec![],
            revenue_leak_total: None,
        };
        SequenceRecord::new(&lead, Segment::Optimize, Utc::now(), 7)
    }

    fn guard(store: Arc<MemoryStore>) -> DuplicateGuard {
        DuplicateGuard::new(store, RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_absent_record_is_fresh() {
        let g = guard(Arc::new(MemoryStore::default()));
        let r = g.check_and_reserve("new@x.com").await.unwrap();
        assert!(matches!(r.decision(), GuardDecision::Fresh));
    }

    #[tokio::test]
    async fn test_record_without_sends() {
        let store = Arc::new(MemoryStore::default());
        store.insert(record("k@x.com"));
        let g = guard(store);
        let r = g.check_and_reserve("k@x.com").await.unwrap();
        assert!(matches!(r.decision(), GuardDecision::DuplicateNoSends(_)));
    }

    #[tokio::test]
    async fn test_record_with_sends_or_cancelled() {
        let store = Arc::new(MemoryStore::default());
        let mut sent = record("sent@x.com");
        sent.steps[0].status = StepStatus::Sent;
        store.insert(sent);
        let mut cancelled = record("gone@x.com");
        cancelled.cancelled = true;
        store.insert(cancelled);

        let g = guard(store);
        let r = g.check_and_reserve("sent@x.com").await.unwrap();
        assert!(matches!(r.decision(), GuardDecision::DuplicateWithSends(_)));
        drop(r);
        let r = g.check_and_reserve("gone@x.com").await.unwrap();
        assert!(matches!(r.decision(), GuardDecision::DuplicateWithSends(_)));
    }

    #[tokio::test]
    async fn test_same_identity_is_serialized() {
        let g = Arc::new(guard(Arc::new(MemoryStore::default())));
        let first = g.check_and_reserve("a@x.com").await.unwrap();

        let g2 = g.clone();
        let waiter = tokio::spawn(async move { g2.check_and_reserve("a@x.com").await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second caller must wait for the first");

        // A different identity is not blocked.
        let other = g.check_and_reserve("b@x.com").await.unwrap();
        drop(other);

        drop(first);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lock_entries_are_released() {
        let g = guard(Arc::new(MemoryStore::default()));
        let r = g.check_and_reserve("a@x.com").await.unwrap();
        assert_eq!(g.active_identities(), 1);
        drop(r);
        assert_eq!(g.active_identities(), 0);
    }
}
