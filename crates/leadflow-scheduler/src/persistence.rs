//! SQLite-backed persistence for sequence records and delivery tasks.
//! One database holds both, so a step's bookkeeping and its queued send
//! survive restarts together.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, params};

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::{CreateOutcome, SequenceStore, TaskScheduler};
use leadflow_core::types::{SendRequest, SequenceRecord, StepState, StepStatus};

use crate::tasks::{DeliveryTask, TaskStats, TaskStatus};

/// SQLite store shared by the intake path and the delivery engine.
pub struct SchedulerDb {
    conn: Mutex<rusqlite::Connection>,
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}

fn ts_error(idx: usize, e: chrono::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// A corrupt timestamp column is a read error.
fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| ts_error(idx, e))
}

fn opt_ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_ts(&raw).map(Some).map_err(|e| ts_error(idx, e)),
        None => Ok(None),
    }
}

impl SchedulerDb {
    /// Open or create the database.
    pub fn open(path: &Path) -> std::result::Result<Self, String> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| format!("DB dir: {e}"))?;
        }
        let conn = rusqlite::Connection::open(path).map_err(|e| format!("DB open: {e}"))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database (tests, `--dry-run` style runs).
    pub fn in_memory() -> std::result::Result<Self, String> {
        let conn =
            rusqlite::Connection::open_in_memory().map_err(|e| format!("DB open: {e}"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> std::result::Result<Self, String> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn migrate(&self) -> std::result::Result<(), String> {
        self.conn()
            .execute_batch(
                "
            PRAGMA foreign_keys = ON;

            -- One row per lead identity
            CREATE TABLE IF NOT EXISTS sequence_records (
                identity TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                segment TEXT NOT NULL,           -- 'critical', 'urgent', 'optimize'
                cancelled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,        -- intake time, offsets are relative to it
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sequence_steps (
                identity TEXT NOT NULL,
                step INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',  -- pending, scheduled, sent
                template_id TEXT,
                task_id TEXT,
                send_at TEXT,
                sent_at TEXT,
                PRIMARY KEY (identity, step),
                FOREIGN KEY (identity) REFERENCES sequence_records(identity) ON DELETE CASCADE
            );

            -- Timed email sends
            CREATE TABLE IF NOT EXISTS delivery_tasks (
                id TEXT PRIMARY KEY,
                identity TEXT NOT NULL,
                step INTEGER NOT NULL,
                send_at TEXT NOT NULL,
                request TEXT NOT NULL,           -- JSON SendRequest
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_delivery_due ON delivery_tasks(status, send_at);
         ",
            )
            .map_err(|e| format!("Migration: {e}"))
    }

    // ─── Sequence records ──────────────────────────────────────

    /// Load one record with its steps.
    pub fn load_record(
        &self,
        identity: &str,
    ) -> std::result::Result<Option<SequenceRecord>, String> {
        let conn = self.conn();
        let head = conn
            .query_row(
                "SELECT identity, email, segment, cancelled, created_at, updated_at
                 FROM sequence_records WHERE identity = ?1",
                [identity],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i32>(3)? != 0,
                        ts_column(row, 4)?,
                        ts_column(row, 5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| format!("Load record: {e}"))?;

        let Some((identity, email, segment, cancelled, created_at, updated_at)) = head else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT step, status, template_id, task_id, send_at, sent_at
                 FROM sequence_steps WHERE identity = ?1 ORDER BY step",
            )
            .map_err(|e| format!("Load steps: {e}"))?;
        let steps = stmt
            .query_map([&identity], |row| {
                Ok(StepState {
                    step: row.get(0)?,
                    status: StepStatus::parse(&row.get::<_, String>(1)?),
                    template_id: row.get(2)?,
                    task_id: row.get(3)?,
                    send_at: opt_ts_column(row, 4)?,
                    sent_at: opt_ts_column(row, 5)?,
                })
            })
            .map_err(|e| format!("Load steps: {e}"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("Load steps: {e}"))?;

        Ok(Some(SequenceRecord {
            identity,
            email,
            segment: segment.parse().map_err(|e| format!("Load record: {e}"))?,
            steps,
            cancelled,
            created_at,
            updated_at,
        }))
    }

    /// Insert the record and its steps unless the identity already exists.
    pub fn insert_record(&self, record: &SequenceRecord) -> std::result::Result<bool, String> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(|e| format!("Begin: {e}"))?;
        let inserted = tx
            .execute(
                "INSERT INTO sequence_records (identity, email, segment, cancelled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(identity) DO NOTHING",
                params![
                    record.identity,
                    record.email,
                    record.segment.to_string(),
                    record.cancelled as i32,
                    ts(&record.created_at),
                    ts(&record.updated_at),
                ],
            )
            .map_err(|e| format!("Insert record: {e}"))?;
        if inserted == 0 {
            return Ok(false);
        }
        for s in &record.steps {
            tx.execute(
                "INSERT INTO sequence_steps (identity, step, status, template_id, task_id, send_at, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.identity,
                    s.step,
                    s.status.as_str(),
                    s.template_id,
                    s.task_id,
                    s.send_at.as_ref().map(ts),
                    s.sent_at.as_ref().map(ts),
                ],
            )
            .map_err(|e| format!("Insert step: {e}"))?;
        }
        tx.commit().map_err(|e| format!("Commit: {e}"))?;
        Ok(true)
    }

    pub fn update_step_scheduled(
        &self,
        identity: &str,
        step: u8,
        template_id: &str,
        task_id: &str,
        send_at: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        let conn = self.conn();
        let n = conn
            .execute(
                "UPDATE sequence_steps SET status = 'scheduled', template_id = ?3, task_id = ?4, send_at = ?5
                 WHERE identity = ?1 AND step = ?2 AND status = 'pending'",
                params![identity, step, template_id, task_id, ts(&send_at)],
            )
            .map_err(|e| format!("Mark scheduled: {e}"))?;
        if n > 0 {
            touch(&conn, identity)?;
        }
        Ok(())
    }

    pub fn update_step_sent(
        &self,
        identity: &str,
        step: u8,
        sent_at: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        let conn = self.conn();
        conn.execute(
            "UPDATE sequence_steps SET status = 'sent', sent_at = ?3 WHERE identity = ?1 AND step = ?2",
            params![identity, step, ts(&sent_at)],
        )
        .map_err(|e| format!("Mark sent: {e}"))?;
        touch(&conn, identity)
    }

    /// Flag the record cancelled and skip its queued sends.
    pub fn cancel_record(&self, identity: &str) -> std::result::Result<bool, String> {
        let conn = self.conn();
        let n = conn
            .execute(
                "UPDATE sequence_records SET cancelled = 1, updated_at = ?2 WHERE identity = ?1",
                params![identity, ts(&Utc::now())],
            )
            .map_err(|e| format!("Cancel: {e}"))?;
        if n == 0 {
            return Ok(false);
        }
        conn.execute(
            "UPDATE delivery_tasks SET status = 'skipped', updated_at = ?2
             WHERE identity = ?1 AND status = 'pending'",
            params![identity, ts(&Utc::now())],
        )
        .map_err(|e| format!("Cancel tasks: {e}"))?;
        Ok(true)
    }

    // ─── Delivery tasks ──────────────────────────────────────

    pub fn save_task(&self, task: &DeliveryTask) -> std::result::Result<(), String> {
        let request =
            serde_json::to_string(&task.request).map_err(|e| format!("Encode task: {e}"))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO delivery_tasks
                 (id, identity, step, send_at, request, status, attempts, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task.id,
                    task.identity,
                    task.step,
                    ts(&task.send_at),
                    request,
                    task.status.as_str(),
                    task.attempts,
                    task.last_error,
                    ts(&task.created_at),
                    ts(&task.updated_at),
                ],
            )
            .map_err(|e| format!("Save task: {e}"))?;
        Ok(())
    }

    pub fn load_task(&self, id: &str) -> std::result::Result<Option<DeliveryTask>, String> {
        self.conn()
            .query_row(
                &format!("{TASK_COLUMNS} WHERE id = ?1"),
                [id],
                task_from_row,
            )
            .optional()
            .map_err(|e| format!("Load task: {e}"))
    }

    pub fn tasks_for(&self, identity: &str) -> std::result::Result<Vec<DeliveryTask>, String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("{TASK_COLUMNS} WHERE identity = ?1 ORDER BY step, created_at"))
            .map_err(|e| format!("Load tasks: {e}"))?;
        stmt.query_map([identity], task_from_row)
            .map_err(|e| format!("Load tasks: {e}"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("Load tasks: {e}"))
    }

    /// Claim up to `limit` due tasks by flipping them to `running`.
    pub fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> std::result::Result<Vec<DeliveryTask>, String> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(|e| format!("Begin: {e}"))?;
        let mut due = {
            let mut stmt = tx
                .prepare(&format!(
                    "{TASK_COLUMNS} WHERE status = 'pending' AND send_at <= ?1 ORDER BY send_at LIMIT ?2"
                ))
                .map_err(|e| format!("Claim: {e}"))?;
            stmt.query_map(params![ts(&now), limit], task_from_row)
                .map_err(|e| format!("Claim: {e}"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| format!("Claim: {e}"))?
        };
        for task in &mut due {
            tx.execute(
                "UPDATE delivery_tasks SET status = 'running', updated_at = ?2 WHERE id = ?1",
                params![task.id, ts(&now)],
            )
            .map_err(|e| format!("Claim: {e}"))?;
            task.status = TaskStatus::Running;
        }
        tx.commit().map_err(|e| format!("Commit: {e}"))?;
        Ok(due)
    }

    /// Record a delivery outcome for a claimed task.
    pub fn finish_task(
        &self,
        id: &str,
        status: TaskStatus,
        attempts: u32,
        last_error: Option<&str>,
        send_at: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), String> {
        let now = ts(&Utc::now());
        self.conn()
            .execute(
                "UPDATE delivery_tasks
                 SET status = ?2, attempts = ?3, last_error = ?4, send_at = COALESCE(?5, send_at), updated_at = ?6
                 WHERE id = ?1",
                params![id, status.as_str(), attempts, last_error, send_at.as_ref().map(ts), now],
            )
            .map_err(|e| format!("Finish task: {e}"))?;
        Ok(())
    }

    /// Tasks left `running` by a crashed process go back to `pending`.
    pub fn recover_running(&self) -> std::result::Result<usize, String> {
        self.conn()
            .execute(
                "UPDATE delivery_tasks SET status = 'pending', updated_at = ?1 WHERE status = 'running'",
                [ts(&Utc::now())],
            )
            .map_err(|e| format!("Recover: {e}"))
    }

    pub fn task_stats(&self) -> std::result::Result<TaskStats, String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM delivery_tasks GROUP BY status")
            .map_err(|e| format!("Stats: {e}"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| format!("Stats: {e}"))?;
        let mut stats = TaskStats::default();
        for row in rows {
            let (status, n) = row.map_err(|e| format!("Stats: {e}"))?;
            let n = n.max(0) as u64;
            match TaskStatus::parse(&status) {
                TaskStatus::Pending => stats.pending = n,
                TaskStatus::Running => stats.running = n,
                TaskStatus::Completed => stats.completed = n,
                TaskStatus::Failed => stats.failed = n,
                TaskStatus::Skipped => stats.skipped = n,
            }
        }
        Ok(stats)
    }
}

const TASK_COLUMNS: &str = "SELECT id, identity, step, send_at, request, status, attempts, \
                            last_error, created_at, updated_at FROM delivery_tasks";

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryTask> {
    let request: String = row.get(4)?;
    let request: SendRequest = serde_json::from_str(&request).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(DeliveryTask {
        id: row.get(0)?,
        identity: row.get(1)?,
        step: row.get(2)?,
        send_at: ts_column(row, 3)?,
        request,
        status: TaskStatus::parse(&row.get::<_, String>(5)?),
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        created_at: ts_column(row, 8)?,
        updated_at: ts_column(row, 9)?,
    })
}

fn touch(conn: &rusqlite::Connection, identity: &str) -> std::result::Result<(), String> {
    conn.execute(
        "UPDATE sequence_records SET updated_at = ?2 WHERE identity = ?1",
        params![identity, ts(&Utc::now())],
    )
    .map_err(|e| format!("Touch record: {e}"))?;
    Ok(())
}

#[async_trait]
impl SequenceStore for SchedulerDb {
    async fn get(&self, identity: &str) -> Result<Option<SequenceRecord>> {
        self.load_record(identity).map_err(LeadflowError::Database)
    }

    async fn create_if_absent(&self, record: &SequenceRecord) -> Result<CreateOutcome> {
        let created = self.insert_record(record).map_err(LeadflowError::Database)?;
        tracing::debug!("Sequence record for {} created={created}", record.identity);
        Ok(if created {
            CreateOutcome::Created
        } else {
            CreateOutcome::AlreadyExists
        })
    }

    async fn mark_scheduled(
        &self,
        identity: &str,
        step: u8,
        template_id: &str,
        task_id: &str,
        send_at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_step_scheduled(identity, step, template_id, task_id, send_at)
            .map_err(LeadflowError::Database)
    }

    async fn mark_sent(&self, identity: &str, step: u8, sent_at: DateTime<Utc>) -> Result<()> {
        self.update_step_sent(identity, step, sent_at)
            .map_err(LeadflowError::Database)
    }

    async fn cancel(&self, identity: &str) -> Result<bool> {
        self.cancel_record(identity).map_err(LeadflowError::Database)
    }
}

#[async_trait]
impl TaskScheduler for SchedulerDb {
    async fn schedule(&self, send_at: DateTime<Utc>, request: SendRequest) -> Result<String> {
        let task = DeliveryTask::new(send_at, request);
        self.save_task(&task)
            .map_err(|e| LeadflowError::downstream("scheduler", e))?;
        tracing::debug!(
            "📅 Queued {} step {} ({}) at {}",
            task.identity,
            task.step,
            task.request.template_id,
            task.send_at
        );
        Ok(task.id)
    }
}
