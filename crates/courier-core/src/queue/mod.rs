//! Durable task queue: state machine, retry policy, and the queue port with
//! its in-memory and SQLite implementations.

mod memory;
mod record;
mod retry;
mod sqlite;
mod state;

pub use memory::MemoryQueue;
pub use record::TaskRecord;
pub use retry::RetryPolicy;
pub use sqlite::SqliteQueue;
pub use state::TaskState;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{TaskEnvelope, TaskId};
use crate::error::CourierError;

/// Lossless enough for queue timing: callers pass delays well below the
/// chrono range.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::TimeDelta::MAX)
}

/// Task counts per state, for status views and operator tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub dead_lettered: usize,
}

/// Queue port.
///
/// The queue is the single source of truth for task state; workers hold no
/// state of their own and coordinate only through these operations. `lease`
/// must be serialized against concurrent callers so two workers can never
/// own the same task at once.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Persist a new task in `Pending` with `next_attempt_at = now` and
    /// return its id. Once this returns, a crash must not lose the task.
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<TaskId, CourierError>;

    /// Atomically take up to `max_n` due tasks in `group`, moving each to
    /// `InFlight` and incrementing its attempt count. Returned records are
    /// snapshots owned by the caller.
    async fn lease(&self, group: &str, max_n: usize) -> Result<Vec<TaskRecord>, CourierError>;

    /// `InFlight` -> `Succeeded`. Idempotent: a second call on a task that
    /// already succeeded is a no-op.
    async fn ack_success(&self, id: TaskId) -> Result<(), CourierError>;

    /// `InFlight` -> `Pending` with `next_attempt_at = now + retry_after`,
    /// or -> `DeadLettered` once the attempt budget is spent.
    async fn ack_failure(
        &self,
        id: TaskId,
        error: &str,
        retry_after: Duration,
    ) -> Result<(), CourierError>;

    /// `InFlight` -> `DeadLettered` regardless of remaining attempts
    /// (fast-fail path for client errors).
    async fn dead_letter(&self, id: TaskId, error: &str) -> Result<(), CourierError>;

    /// Release leases stuck `InFlight` longer than `timeout`. A task with
    /// budget remaining reverts to `Pending` so another worker can pick it
    /// up; one whose final attempt died is dead-lettered, never re-leased.
    /// Returns how many stale leases were released. This is what makes
    /// delivery at-least-once across worker crashes.
    async fn release_stale_leases(&self, timeout: Duration) -> Result<usize, CourierError>;

    /// Remove a task, but only while it is `Pending`. An `InFlight` task
    /// finishes its current attempt first. Returns whether it was removed.
    async fn cancel(&self, id: TaskId) -> Result<bool, CourierError>;

    /// Drop terminal tasks (`Succeeded`, `DeadLettered`) untouched for longer
    /// than `retain`. Returns how many were purged.
    async fn purge_terminal(&self, retain: Duration) -> Result<usize, CourierError>;

    /// Snapshot of one task, if it still exists.
    async fn status(&self, id: TaskId) -> Result<Option<TaskRecord>, CourierError>;

    /// Counts by state, optionally restricted to one group.
    async fn counts(&self, group: Option<&str>) -> Result<QueueCounts, CourierError>;
}
