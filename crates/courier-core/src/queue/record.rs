//! Task record: metadata + envelope.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::TaskState;
use crate::domain::{TaskEnvelope, TaskId};

/// A task as the queue stores it.
///
/// All state transitions happen through the methods here, so both queue
/// implementations share one state machine. Queue implementations only decide
/// *when* to call them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub envelope: TaskEnvelope,
    pub state: TaskState,

    /// Attempts started so far (incremented when an attempt begins, so it
    /// counts the current one while `InFlight`). Strictly increasing.
    pub attempt_count: u32,

    /// Budget: once `attempt_count` reaches this, the next failure
    /// dead-letters the task.
    pub max_attempts: u32,

    /// The task is eligible for lease only when now >= this.
    pub next_attempt_at: DateTime<Utc>,

    /// When the current lease was taken (`InFlight` only).
    pub leased_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, envelope: TaskEnvelope, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            envelope,
            state: TaskState::Pending,
            attempt_count: 0,
            max_attempts,
            next_attempt_at: now,
            leased_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_leasable() && self.next_attempt_at <= now
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Pending -> InFlight, counting the attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::InFlight;
        self.attempt_count += 1;
        self.leased_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Succeeded;
        self.leased_at = None;
        self.updated_at = now;
    }

    pub fn mark_dead_lettered(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.state = TaskState::DeadLettered;
        self.leased_at = None;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// InFlight -> Pending with a future `next_attempt_at`.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = TaskState::Pending;
        self.leased_at = None;
        self.last_error = Some(error.into());
        self.next_attempt_at = next_attempt_at;
        self.updated_at = now;
    }

    /// Stale-lease recovery: InFlight -> Pending, immediately due. The
    /// attempt that died keeps its count.
    pub fn reclaim(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Pending;
        self.leased_at = None;
        self.next_attempt_at = now;
        self.updated_at = now;
    }

    /// Whether the current lease is older than `timeout` at `now`.
    pub fn lease_is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.state == TaskState::InFlight
            && self
                .leased_at
                .is_some_and(|leased_at| leased_at + timeout <= now)
    }
}
