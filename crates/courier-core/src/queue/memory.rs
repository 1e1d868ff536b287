//! In-memory queue implementation.
//!
//! Dev and test backend: same semantics as the SQLite queue, no durability.
//! All state lives under one async mutex; `lease` does its select-and-mark
//! inside a single critical section, which is what makes it exclusive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{to_chrono, Queue, QueueCounts, TaskRecord, TaskState};
use crate::clock::Clock;
use crate::domain::{TaskEnvelope, TaskId};
use crate::error::CourierError;

pub struct MemoryQueue {
    records: Mutex<HashMap<TaskId, TaskRecord>>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            max_attempts,
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<TaskId, CourierError> {
        let now = self.clock.now();
        let id = TaskId::generate(self.clock.as_ref());

        debug!(
            task_id = %id,
            group = envelope.group(),
            correlation_id = envelope.correlation_id(),
            "enqueued task"
        );

        let record = TaskRecord::new(id, envelope, self.max_attempts, now);
        self.records.lock().await.insert(id, record);
        Ok(id)
    }

    async fn lease(&self, group: &str, max_n: usize) -> Result<Vec<TaskRecord>, CourierError> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;

        let mut due: Vec<TaskId> = records
            .values()
            .filter(|r| r.envelope.group() == group && r.is_due(now))
            .map(|r| r.id)
            .collect();
        // Oldest due first, id as tiebreak (ULIDs sort by creation time).
        due.sort_by_key(|id| (records[id].next_attempt_at, *id));
        due.truncate(max_n);

        let mut leased = Vec::with_capacity(due.len());
        for id in due {
            if let Some(record) = records.get_mut(&id) {
                record.begin_attempt(now);
                leased.push(record.clone());
            }
        }
        Ok(leased)
    }

    async fn ack_success(&self, id: TaskId) -> Result<(), CourierError> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(CourierError::TaskNotFound(id))?;

        // Idempotent: a duplicate ack after the state already settled is fine.
        if record.state != TaskState::InFlight {
            return Ok(());
        }

        record.mark_succeeded(now);
        info!(
            task_id = %id,
            correlation_id = record.envelope.correlation_id(),
            attempts = record.attempt_count,
            "task succeeded"
        );
        Ok(())
    }

    async fn ack_failure(
        &self,
        id: TaskId,
        error: &str,
        retry_after: Duration,
    ) -> Result<(), CourierError> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(CourierError::TaskNotFound(id))?;

        if record.state != TaskState::InFlight {
            return Ok(());
        }

        if record.attempts_exhausted() {
            record.mark_dead_lettered(error, now);
            error!(
                task_id = %id,
                correlation_id = record.envelope.correlation_id(),
                attempts = record.attempt_count,
                last_error = error,
                "attempts exhausted, task dead-lettered"
            );
        } else {
            let next = now + to_chrono(retry_after);
            record.schedule_retry(error, next, now);
            warn!(
                task_id = %id,
                correlation_id = record.envelope.correlation_id(),
                attempts = record.attempt_count,
                retry_after_ms = retry_after.as_millis() as u64,
                error,
                "task failed, retry scheduled"
            );
        }
        Ok(())
    }

    async fn dead_letter(&self, id: TaskId, error: &str) -> Result<(), CourierError> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(CourierError::TaskNotFound(id))?;

        if record.state != TaskState::InFlight {
            return Ok(());
        }

        record.mark_dead_lettered(error, now);
        error!(
            task_id = %id,
            correlation_id = record.envelope.correlation_id(),
            attempts = record.attempt_count,
            last_error = error,
            "task dead-lettered"
        );
        Ok(())
    }

    async fn release_stale_leases(&self, timeout: Duration) -> Result<usize, CourierError> {
        let now = self.clock.now();
        let timeout = to_chrono(timeout);
        let mut records = self.records.lock().await;

        let mut released = 0;
        for record in records.values_mut() {
            if !record.lease_is_stale(timeout, now) {
                continue;
            }
            released += 1;
            // The attempt that died was counted at lease time; re-pending a
            // task with a spent budget would push it past max_attempts.
            if record.attempts_exhausted() {
                record.mark_dead_lettered("lease expired on final attempt", now);
                error!(
                    task_id = %record.id,
                    correlation_id = record.envelope.correlation_id(),
                    attempts = record.attempt_count,
                    "stale lease on exhausted task, dead-lettered"
                );
            } else {
                record.reclaim(now);
                warn!(
                    task_id = %record.id,
                    correlation_id = record.envelope.correlation_id(),
                    attempts = record.attempt_count,
                    "stale lease reclaimed"
                );
            }
        }
        Ok(released)
    }

    async fn cancel(&self, id: TaskId) -> Result<bool, CourierError> {
        let mut records = self.records.lock().await;
        match records.get(&id) {
            Some(record) if record.state == TaskState::Pending => {
                records.remove(&id);
                debug!(task_id = %id, "pending task cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_terminal(&self, retain: Duration) -> Result<usize, CourierError> {
        let cutoff = self.clock.now() - to_chrono(retain);
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| !(r.state.is_terminal() && r.updated_at <= cutoff));
        Ok(before - records.len())
    }

    async fn status(&self, id: TaskId) -> Result<Option<TaskRecord>, CourierError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn counts(&self, group: Option<&str>) -> Result<QueueCounts, CourierError> {
        let records = self.records.lock().await;
        let mut counts = QueueCounts::default();
        for record in records.values() {
            if let Some(group) = group
                && record.envelope.group() != group
            {
                continue;
            }
            match record.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::InFlight => counts.in_flight += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::DeadLettered => counts.dead_lettered += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;

    const GROUP: &str = "webhooks";

    fn queue_with_clock(max_attempts: u32) -> (MemoryQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (MemoryQueue::new(clock.clone(), max_attempts), clock)
    }

    fn envelope() -> TaskEnvelope {
        TaskEnvelope::new(GROUP, br#"[{"a":1}]"#.to_vec(), "product-42")
    }

    #[tokio::test]
    async fn enqueue_then_lease_moves_to_in_flight() {
        let (queue, _) = queue_with_clock(5);
        let id = queue.enqueue(envelope()).await.unwrap();

        let leased = queue.lease(GROUP, 10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, id);
        assert_eq!(leased[0].attempt_count, 1);

        let counts = queue.counts(Some(GROUP)).await.unwrap();
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn lease_respects_group_and_batch_size() {
        let (queue, _) = queue_with_clock(5);
        for _ in 0..3 {
            queue.enqueue(envelope()).await.unwrap();
        }
        queue
            .enqueue(TaskEnvelope::new("other", b"[]".to_vec(), "x"))
            .await
            .unwrap();

        let leased = queue.lease(GROUP, 2).await.unwrap();
        assert_eq!(leased.len(), 2);
        let leased = queue.lease(GROUP, 10).await.unwrap();
        assert_eq!(leased.len(), 1);
        let leased = queue.lease("other", 10).await.unwrap();
        assert_eq!(leased.len(), 1);
    }

    #[tokio::test]
    async fn leased_tasks_are_never_handed_out_twice() {
        let (queue, _) = queue_with_clock(5);
        queue.enqueue(envelope()).await.unwrap();

        let first = queue.lease(GROUP, 10).await.unwrap();
        let second = queue.lease(GROUP, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn ack_success_is_idempotent() {
        let (queue, _) = queue_with_clock(5);
        let id = queue.enqueue(envelope()).await.unwrap();
        queue.lease(GROUP, 1).await.unwrap();

        queue.ack_success(id).await.unwrap();
        queue.ack_success(id).await.unwrap();

        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test]
    async fn failure_schedules_retry_with_backoff_delay() {
        let (queue, clock) = queue_with_clock(5);
        let id = queue.enqueue(envelope()).await.unwrap();
        queue.lease(GROUP, 1).await.unwrap();

        queue
            .ack_failure(id, "sink returned status 500", Duration::from_secs(4))
            .await
            .unwrap();

        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(
            record.last_error.as_deref(),
            Some("sink returned status 500")
        );

        // Not due yet.
        assert!(queue.lease(GROUP, 1).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(5));
        let leased = queue.lease(GROUP, 1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_with_last_error() {
        let (queue, clock) = queue_with_clock(3);
        let id = queue.enqueue(envelope()).await.unwrap();

        for _ in 0..3 {
            let leased = queue.lease(GROUP, 1).await.unwrap();
            assert_eq!(leased.len(), 1);
            queue
                .ack_failure(id, "sink returned status 503", Duration::from_secs(1))
                .await
                .unwrap();
            clock.advance(chrono::Duration::seconds(2));
        }

        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::DeadLettered);
        assert_eq!(record.attempt_count, 3);
        assert!(record.last_error.unwrap().contains("503"));

        // Never auto-retried again.
        clock.advance(chrono::Duration::days(1));
        assert!(queue.lease(GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed_once_past_timeout() {
        let (queue, clock) = queue_with_clock(5);
        let id = queue.enqueue(envelope()).await.unwrap();
        queue.lease(GROUP, 1).await.unwrap();
        // Worker crashes here: no ack arrives.

        clock.advance(chrono::Duration::seconds(29));
        assert_eq!(
            queue
                .release_stale_leases(Duration::from_secs(30))
                .await
                .unwrap(),
            0
        );

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(
            queue
                .release_stale_leases(Duration::from_secs(30))
                .await
                .unwrap(),
            1
        );
        // Only once per timeout window.
        assert_eq!(
            queue
                .release_stale_leases(Duration::from_secs(30))
                .await
                .unwrap(),
            0
        );

        let leased = queue.lease(GROUP, 1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, id);
        assert_eq!(leased[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn repeated_crashes_never_exceed_the_attempt_budget() {
        let (queue, clock) = queue_with_clock(2);
        let id = queue.enqueue(envelope()).await.unwrap();

        // First crash: budget remains, so the task goes back to pending.
        assert_eq!(queue.lease(GROUP, 1).await.unwrap().len(), 1);
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(
            queue
                .release_stale_leases(Duration::from_secs(30))
                .await
                .unwrap(),
            1
        );

        // Second crash spends the final attempt; reclaim must dead-letter.
        assert_eq!(queue.lease(GROUP, 1).await.unwrap().len(), 1);
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(
            queue
                .release_stale_leases(Duration::from_secs(30))
                .await
                .unwrap(),
            1
        );

        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::DeadLettered);
        assert_eq!(record.attempt_count, 2);
        assert!(record.last_error.unwrap().contains("lease expired"));
        assert!(queue.lease(GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_only_removes_pending_tasks() {
        let (queue, _) = queue_with_clock(5);
        let pending = queue.enqueue(envelope()).await.unwrap();
        let leased_id = queue.enqueue(envelope()).await.unwrap();
        // Lease everything, then put `pending` back via failure.
        queue.lease(GROUP, 10).await.unwrap();
        queue
            .ack_failure(pending, "x", Duration::from_secs(0))
            .await
            .unwrap();

        assert!(queue.cancel(pending).await.unwrap());
        assert!(!queue.cancel(leased_id).await.unwrap());
        assert!(queue.status(pending).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_drops_only_old_terminal_tasks() {
        let (queue, clock) = queue_with_clock(5);
        let done = queue.enqueue(envelope()).await.unwrap();
        queue.lease(GROUP, 1).await.unwrap();
        queue.ack_success(done).await.unwrap();
        let fresh = queue.enqueue(envelope()).await.unwrap();

        clock.advance(chrono::Duration::hours(25));
        let purged = queue
            .purge_terminal(Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(queue.status(done).await.unwrap().is_none());
        assert!(queue.status(fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn acks_for_unknown_tasks_are_errors() {
        let (queue, _) = queue_with_clock(5);
        let id = TaskId::generate(&crate::clock::SystemClock);
        assert!(matches!(
            queue.ack_success(id).await,
            Err(CourierError::TaskNotFound(_))
        ));
    }
}
