//! SQLite-backed durable queue.
//!
//! All SQL runs on tokio-rusqlite's dedicated connection thread; calls execute
//! FIFO, so concurrent `lease` callers are serialized and can never take
//! overlapping task sets. Each multi-step operation additionally runs in a
//! transaction so a crash mid-operation leaves the file consistent. A task
//! that was enqueued is on disk before `enqueue` returns.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension};
use tokio_rusqlite::Connection;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::{to_chrono, Queue, QueueCounts, TaskRecord, TaskState};
use crate::clock::Clock;
use crate::domain::{TaskEnvelope, TaskId};
use crate::error::CourierError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    task_group      TEXT NOT NULL,
    payload         BLOB NOT NULL,
    correlation_id  TEXT NOT NULL,
    state           TEXT NOT NULL,
    attempt_count   INTEGER NOT NULL,
    max_attempts    INTEGER NOT NULL,
    next_attempt_at TEXT NOT NULL,
    leased_at       TEXT,
    last_error      TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_due
    ON tasks (task_group, state, next_attempt_at);
";

const SELECT_COLUMNS: &str = "id, task_group, payload, correlation_id, state, \
     attempt_count, max_attempts, next_attempt_at, leased_at, last_error, \
     created_at, updated_at";

pub struct SqliteQueue {
    conn: Connection,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl SqliteQueue {
    /// Open (creating if needed) the queue database at `path` and apply the
    /// schema.
    pub async fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Result<Self, CourierError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| CourierError::QueueUnavailable(e.to_string()))?;
        }

        let conn = Connection::open(path).await.map_err(unavailable)?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(unavailable)?;

        info!(path = %path.display(), "sqlite queue opened");
        Ok(Self {
            conn,
            clock,
            max_attempts,
        })
    }
}

#[async_trait]
impl Queue for SqliteQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<TaskId, CourierError> {
        let now = self.clock.now();
        let id = TaskId::generate(self.clock.as_ref());
        let group = envelope.group().to_string();
        let correlation_id = envelope.correlation_id().to_string();
        let record = TaskRecord::new(id, envelope, self.max_attempts, now);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, task_group, payload, correlation_id, state, \
                     attempt_count, max_attempts, next_attempt_at, leased_at, last_error, \
                     created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        record.id.as_ulid().to_string(),
                        record.envelope.group(),
                        record.envelope.payload(),
                        record.envelope.correlation_id(),
                        record.state.as_str(),
                        record.attempt_count,
                        record.max_attempts,
                        ts(record.next_attempt_at),
                        record.leased_at.map(ts),
                        record.last_error,
                        ts(record.created_at),
                        ts(record.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(unavailable)?;

        debug!(
            task_id = %id,
            group = %group,
            correlation_id = %correlation_id,
            "enqueued task"
        );
        Ok(id)
    }

    async fn lease(&self, group: &str, max_n: usize) -> Result<Vec<TaskRecord>, CourierError> {
        let now = self.clock.now();
        let group = group.to_string();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut records = {
                    let mut stmt = tx.prepare_cached(&format!(
                        "SELECT {SELECT_COLUMNS} FROM tasks \
                         WHERE task_group = ?1 AND state = 'pending' AND next_attempt_at <= ?2 \
                         ORDER BY next_attempt_at, id LIMIT ?3"
                    ))?;
                    let rows = stmt.query_map(
                        params![group, ts(now), max_n as i64],
                        row_to_record,
                    )?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                for record in &mut records {
                    record.begin_attempt(now);
                    update_record(&tx, record)?;
                }
                tx.commit()?;
                Ok(records)
            })
            .await
            .map_err(unavailable)
    }

    async fn ack_success(&self, id: TaskId) -> Result<(), CourierError> {
        let now = self.clock.now();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(mut record) = load_record(&tx, id)? else {
                    return Ok(None);
                };
                // Idempotent: only an in-flight task transitions.
                let changed = record.state == TaskState::InFlight;
                if changed {
                    record.mark_succeeded(now);
                    update_record(&tx, &record)?;
                }
                tx.commit()?;
                Ok(Some((record, changed)))
            })
            .await
            .map_err(unavailable)?;

        let (record, changed) = outcome.ok_or(CourierError::TaskNotFound(id))?;
        if changed {
            info!(
                task_id = %id,
                correlation_id = record.envelope.correlation_id(),
                attempts = record.attempt_count,
                "task succeeded"
            );
        }
        Ok(())
    }

    async fn ack_failure(
        &self,
        id: TaskId,
        error: &str,
        retry_after: Duration,
    ) -> Result<(), CourierError> {
        let now = self.clock.now();
        let error = error.to_string();
        let retry_at = now + to_chrono(retry_after);

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(mut record) = load_record(&tx, id)? else {
                    return Ok(None);
                };
                let changed = record.state == TaskState::InFlight;
                if changed {
                    if record.attempts_exhausted() {
                        record.mark_dead_lettered(error, now);
                    } else {
                        record.schedule_retry(error, retry_at, now);
                    }
                    update_record(&tx, &record)?;
                }
                tx.commit()?;
                Ok(Some((record, changed)))
            })
            .await
            .map_err(unavailable)?;

        let (record, changed) = outcome.ok_or(CourierError::TaskNotFound(id))?;
        if changed {
            match record.state {
                TaskState::DeadLettered => error!(
                    task_id = %id,
                    correlation_id = record.envelope.correlation_id(),
                    attempts = record.attempt_count,
                    last_error = record.last_error.as_deref().unwrap_or(""),
                    "attempts exhausted, task dead-lettered"
                ),
                _ => warn!(
                    task_id = %id,
                    correlation_id = record.envelope.correlation_id(),
                    attempts = record.attempt_count,
                    retry_after_ms = retry_after.as_millis() as u64,
                    error = record.last_error.as_deref().unwrap_or(""),
                    "task failed, retry scheduled"
                ),
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, id: TaskId, error: &str) -> Result<(), CourierError> {
        let now = self.clock.now();
        let error = error.to_string();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(mut record) = load_record(&tx, id)? else {
                    return Ok(None);
                };
                let changed = record.state == TaskState::InFlight;
                if changed {
                    record.mark_dead_lettered(error, now);
                    update_record(&tx, &record)?;
                }
                tx.commit()?;
                Ok(Some((record, changed)))
            })
            .await
            .map_err(unavailable)?;

        let (record, changed) = outcome.ok_or(CourierError::TaskNotFound(id))?;
        if changed {
            error!(
                task_id = %id,
                correlation_id = record.envelope.correlation_id(),
                attempts = record.attempt_count,
                last_error = record.last_error.as_deref().unwrap_or(""),
                "task dead-lettered"
            );
        }
        Ok(())
    }

    async fn release_stale_leases(&self, timeout: Duration) -> Result<usize, CourierError> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(timeout);

        let released = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut records = {
                    let mut stmt = tx.prepare_cached(&format!(
                        "SELECT {SELECT_COLUMNS} FROM tasks \
                         WHERE state = 'in_flight' AND leased_at <= ?1"
                    ))?;
                    let rows = stmt.query_map(params![ts(cutoff)], row_to_record)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                for record in &mut records {
                    // The attempt that died was counted at lease time;
                    // re-pending a task with a spent budget would push it
                    // past max_attempts.
                    if record.attempts_exhausted() {
                        record.mark_dead_lettered("lease expired on final attempt", now);
                    } else {
                        record.reclaim(now);
                    }
                    update_record(&tx, record)?;
                }
                tx.commit()?;
                Ok(records)
            })
            .await
            .map_err(unavailable)?;

        for record in &released {
            match record.state {
                TaskState::DeadLettered => error!(
                    task_id = %record.id,
                    correlation_id = record.envelope.correlation_id(),
                    attempts = record.attempt_count,
                    "stale lease on exhausted task, dead-lettered"
                ),
                _ => warn!(
                    task_id = %record.id,
                    correlation_id = record.envelope.correlation_id(),
                    attempts = record.attempt_count,
                    "stale lease reclaimed"
                ),
            }
        }
        Ok(released.len())
    }

    async fn cancel(&self, id: TaskId) -> Result<bool, CourierError> {
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM tasks WHERE id = ?1 AND state = 'pending'",
                    params![id.as_ulid().to_string()],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(unavailable)?;
        if removed {
            debug!(task_id = %id, "pending task cancelled");
        }
        Ok(removed)
    }

    async fn purge_terminal(&self, retain: Duration) -> Result<usize, CourierError> {
        let cutoff = self.clock.now() - to_chrono(retain);
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM tasks \
                     WHERE state IN ('succeeded', 'dead_lettered') AND updated_at <= ?1",
                    params![ts(cutoff)],
                )?;
                Ok(n)
            })
            .await
            .map_err(unavailable)
    }

    async fn status(&self, id: TaskId) -> Result<Option<TaskRecord>, CourierError> {
        self.conn
            .call(move |conn| load_record(conn, id).map_err(Into::into))
            .await
            .map_err(unavailable)
    }

    async fn counts(&self, group: Option<&str>) -> Result<QueueCounts, CourierError> {
        let group = group.map(str::to_string);
        self.conn
            .call(move |conn| {
                let mut counts = QueueCounts::default();
                let mut tally = |state: String, n: usize| match TaskState::parse(&state) {
                    Some(TaskState::Pending) => counts.pending += n,
                    Some(TaskState::InFlight) => counts.in_flight += n,
                    Some(TaskState::Succeeded) => counts.succeeded += n,
                    Some(TaskState::DeadLettered) => counts.dead_lettered += n,
                    None => {}
                };
                match &group {
                    Some(g) => {
                        let mut stmt = tx_counts_stmt(conn, true)?;
                        let rows = stmt.query_map(params![g], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                        })?;
                        for row in rows {
                            let (state, n) = row?;
                            tally(state, n as usize);
                        }
                    }
                    None => {
                        let mut stmt = tx_counts_stmt(conn, false)?;
                        let rows = stmt.query_map([], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                        })?;
                        for row in rows {
                            let (state, n) = row?;
                            tally(state, n as usize);
                        }
                    }
                }
                Ok(counts)
            })
            .await
            .map_err(unavailable)
    }
}

fn tx_counts_stmt<'a>(
    conn: &'a SqliteConnection,
    by_group: bool,
) -> rusqlite::Result<rusqlite::CachedStatement<'a>> {
    if by_group {
        conn.prepare_cached(
            "SELECT state, COUNT(*) FROM tasks WHERE task_group = ?1 GROUP BY state",
        )
    } else {
        conn.prepare_cached("SELECT state, COUNT(*) FROM tasks GROUP BY state")
    }
}

fn unavailable(e: tokio_rusqlite::Error) -> CourierError {
    CourierError::QueueUnavailable(e.to_string())
}

/// Fixed-precision UTC timestamps so string comparison in SQL is
/// chronological.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_error(
    index: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, e.into())
}

fn parse_ts(index: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| decode_error(index, Box::new(e)))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let id: String = row.get(0)?;
    let group: String = row.get(1)?;
    let payload: Vec<u8> = row.get(2)?;
    let correlation_id: String = row.get(3)?;
    let state: String = row.get(4)?;
    let attempt_count: u32 = row.get(5)?;
    let max_attempts: u32 = row.get(6)?;
    let next_attempt_at: String = row.get(7)?;
    let leased_at: Option<String> = row.get(8)?;
    let last_error: Option<String> = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    let id = Ulid::from_string(&id)
        .map(TaskId::from_ulid)
        .map_err(|e| decode_error(0, Box::new(e)))?;
    let state = TaskState::parse(&state)
        .ok_or_else(|| decode_error(4, format!("unknown task state: {state}")))?;

    Ok(TaskRecord {
        id,
        envelope: TaskEnvelope::new(group, payload, correlation_id),
        state,
        attempt_count,
        max_attempts,
        next_attempt_at: parse_ts(7, &next_attempt_at)?,
        leased_at: leased_at.as_deref().map(|s| parse_ts(8, s)).transpose()?,
        last_error,
        created_at: parse_ts(10, &created_at)?,
        updated_at: parse_ts(11, &updated_at)?,
    })
}

fn update_record(conn: &SqliteConnection, record: &TaskRecord) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE tasks SET state = ?2, attempt_count = ?3, next_attempt_at = ?4, \
         leased_at = ?5, last_error = ?6, updated_at = ?7 WHERE id = ?1",
        params![
            record.id.as_ulid().to_string(),
            record.state.as_str(),
            record.attempt_count,
            ts(record.next_attempt_at),
            record.leased_at.map(ts),
            record.last_error,
            ts(record.updated_at),
        ],
    )?;
    Ok(())
}

fn load_record(conn: &SqliteConnection, id: TaskId) -> rusqlite::Result<Option<TaskRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SELECT_COLUMNS} FROM tasks WHERE id = ?1"
    ))?;
    stmt.query_row(params![id.as_ulid().to_string()], row_to_record)
        .optional()
}
