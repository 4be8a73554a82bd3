//! In-memory collaborators for router unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::{AlertSink, CreateOutcome, SequenceStore, TaskScheduler};
use leadflow_core::types::{SendRequest, SequenceRecord, StepStatus};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SequenceRecord>>,
    pub creates: AtomicU32,
}

impl MemoryStore {
    pub fn insert(&self, record: SequenceRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.identity.clone(), record);
    }

    pub fn snapshot(&self, identity: &str) -> Option<SequenceRecord> {
        self.records.lock().unwrap().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl SequenceStore for MemoryStore {
    async fn get(&self, identity: &str) -> Result<Option<SequenceRecord>> {
        Ok(self.snapshot(identity))
    }

    async fn create_if_absent(&self, record: &SequenceRecord) -> Result<CreateOutcome> {
        let mut map = self.records.lock().unwrap();
        if map.contains_key(&record.identity) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        map.insert(record.identity.clone(), record.clone());
        Ok(CreateOutcome::Created)
    }

    async fn mark_scheduled(
        &self,
        identity: &str,
        step: u8,
        template_id: &str,
        task_id: &str,
        send_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut map = self.records.lock().unwrap();
        let record = map
            .get_mut(identity)
            .ok_or_else(|| LeadflowError::Database(format!("no record for {identity}")))?;
        if let Some(s) = record.steps.iter_mut().find(|s| s.step == step) {
            s.status = StepStatus::Scheduled;
            s.template_id = Some(template_id.to_string());
            s.task_id = Some(task_id.to_string());
            s.send_at = Some(send_at);
        }
        Ok(())
    }

    async fn mark_sent(&self, identity: &str, step: u8, sent_at: DateTime<Utc>) -> Result<()> {
        let mut map = self.records.lock().unwrap();
        if let Some(s) = map
            .get_mut(identity)
            .and_then(|r| r.steps.iter_mut().find(|s| s.step == step))
        {
            s.status = StepStatus::Sent;
            s.sent_at = Some(sent_at);
        }
        Ok(())
    }

    async fn cancel(&self, identity: &str) -> Result<bool> {
        let mut map = self.records.lock().unwrap();
        Ok(map.get_mut(identity).map(|r| r.cancelled = true).is_some())
    }
}

/// Scheduler that records requests and fails the steps it is told to.
#[derive(Default)]
pub struct RecordingScheduler {
    pub requests: Mutex<Vec<(DateTime<Utc>, SendRequest)>>,
    pub fail_steps: Mutex<Vec<u8>>,
    next_id: AtomicU32,
}

impl RecordingScheduler {
    pub fn failing(steps: &[u8]) -> Self {
        let s = Self::default();
        *s.fail_steps.lock().unwrap() = steps.to_vec();
        s
    }

    pub fn steps(&self) -> Vec<u8> {
        self.requests.lock().unwrap().iter().map(|(_, r)| r.step).collect()
    }
}

#[async_trait]
impl TaskScheduler for RecordingScheduler {
    async fn schedule(&self, send_at: DateTime<Utc>, request: SendRequest) -> Result<String> {
        if self.fail_steps.lock().unwrap().contains(&request.step) {
            return Err(LeadflowError::downstream("scheduler", "queue unavailable"));
        }
        self.requests.lock().unwrap().push((send_at, request));
        Ok(format!("task-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub sent: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn alert(&self, title: &str, _body: &str) -> Result<()> {
        if self.fail {
            return Err(LeadflowError::downstream("alert", "webhook 500"));
        }
        self.sent.lock().unwrap().push(title.to_string());
        Ok(())
    }
}
