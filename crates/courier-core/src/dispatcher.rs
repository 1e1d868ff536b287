//! Dispatcher: pulls due tasks from the queue, runs deliveries, and feeds
//! outcomes back as acks.
//!
//! Workers hold no task state of their own; the queue's `lease`/`ack_*`
//! operations are the only coordination. A dispatcher may be restarted freely
//! at any point, with the reaper reclaiming whatever a dead instance left
//! in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::DeliverySink;
use crate::domain::Disposition;
use crate::error::CourierError;
use crate::queue::{Queue, RetryPolicy};

/// Terminal tasks are swept on this cadence (the retention itself is
/// `audit_window`).
const JANITOR_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Queue group this dispatcher drains.
    pub group: String,
    /// Worker count = maximum concurrent deliveries. A slow sink can stall
    /// at most this many tasks at once, each bounded by the client timeout.
    pub workers: usize,
    /// Tasks leased per poll.
    pub batch_size: usize,
    /// Idle sleep between polls when nothing was due.
    pub poll_interval: Duration,
    /// An `InFlight` task older than this is considered orphaned.
    pub lease_timeout: Duration,
    /// How long terminal tasks are kept for inspection.
    pub audit_window: Duration,
    pub retry: RetryPolicy,
    /// Dead-letter on the first 3xx/4xx (except 429) instead of burning the
    /// whole attempt budget.
    pub fast_fail_client_errors: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            group: "webhook-delivery".to_string(),
            workers: 2,
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            lease_timeout: Duration::from_secs(60),
            audit_window: Duration::from_secs(24 * 3600),
            retry: RetryPolicy::default(),
            fast_fail_client_errors: false,
        }
    }
}

/// Running dispatcher: worker loops plus the reaper and janitor.
///
/// Dropping the handle without [`Dispatcher::shutdown_and_join`] aborts
/// nothing; request shutdown to stop taking new leases, then join. In-flight
/// deliveries finish their current attempt; there is no mid-flight abort.
pub struct Dispatcher {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(
        queue: Arc<dyn Queue>,
        sink: Arc<dyn DeliverySink>,
        config: DispatcherConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(config.workers + 2);

        for worker_id in 0..config.workers.max(1) {
            let queue = Arc::clone(&queue);
            let sink = Arc::clone(&sink);
            let config = config.clone();
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, sink, config, &mut rx).await;
            }));
        }

        {
            let queue = Arc::clone(&queue);
            let config = config.clone();
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                reaper_loop(queue, config, &mut rx).await;
            }));
        }
        {
            let queue = Arc::clone(&queue);
            let config = config.clone();
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                janitor_loop(queue, config, &mut rx).await;
            }));
        }

        info!(
            group = %config.group,
            workers = config.workers.max(1),
            "dispatcher started"
        );
        Self { shutdown_tx, joins }
    }

    /// Stop taking new leases. In-flight attempts run to completion.
    pub fn request_shutdown(&self) {
        // Receivers may already be gone; nothing to do then.
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn Queue>,
    sink: Arc<dyn DeliverySink>,
    config: DispatcherConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let processed = match process_batch(queue.as_ref(), sink.as_ref(), &config).await {
            Ok(n) => n,
            Err(e) => {
                warn!(worker_id, error = %e, "dispatch cycle failed");
                0
            }
        };

        if processed == 0 {
            // Nothing due: sleep, but wake early for shutdown.
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

/// One dispatch cycle: lease a batch and deliver it. Returns how many tasks
/// were leased.
async fn process_batch(
    queue: &dyn Queue,
    sink: &dyn DeliverySink,
    config: &DispatcherConfig,
) -> Result<usize, CourierError> {
    let tasks = queue.lease(&config.group, config.batch_size).await?;
    let leased = tasks.len();

    for task in tasks {
        debug!(
            task_id = %task.id,
            correlation_id = task.envelope.correlation_id(),
            attempt = task.attempt_count,
            max_attempts = task.max_attempts,
            "dispatching delivery"
        );

        let outcome = sink.deliver(&task.envelope).await;
        let ack = match outcome.disposition(config.fast_fail_client_errors) {
            Disposition::Success => queue.ack_success(task.id).await,
            Disposition::Retry => {
                let delay = config.retry.next_delay(task.attempt_count);
                queue
                    .ack_failure(task.id, &outcome.describe(), delay)
                    .await
            }
            Disposition::FastFail => queue.dead_letter(task.id, &outcome.describe()).await,
        };
        // An ack failure leaves the task in flight; the reaper will
        // eventually re-pend it, so log and keep draining the batch.
        if let Err(e) = ack {
            warn!(task_id = %task.id, error = %e, "failed to record delivery outcome");
        }
    }
    Ok(leased)
}

async fn reaper_loop(
    queue: Arc<dyn Queue>,
    config: DispatcherConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let interval = (config.lease_timeout / 2).max(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }
        match queue.release_stale_leases(config.lease_timeout).await {
            Ok(0) => {}
            Ok(n) => warn!(reclaimed = n, "reclaimed orphaned leases"),
            Err(e) => warn!(error = %e, "stale-lease sweep failed"),
        }
    }
}

async fn janitor_loop(
    queue: Arc<dyn Queue>,
    config: DispatcherConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(JANITOR_INTERVAL) => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }
        match queue.purge_terminal(config.audit_window).await {
            Ok(0) => {}
            Ok(n) => debug!(purged = n, "purged terminal tasks"),
            Err(e) => warn!(error = %e, "terminal purge failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Mutex;

    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::domain::{DeliveryOutcome, TaskEnvelope, TaskId};
    use crate::queue::{MemoryQueue, TaskState};

    const GROUP: &str = "webhook-delivery";

    /// Sink that replays a fixed script of outcomes.
    struct ScriptedSink {
        script: Mutex<VecDeque<DeliveryOutcome>>,
    }

    impl ScriptedSink {
        fn new(outcomes: impl IntoIterator<Item = DeliveryOutcome>) -> Self {
            Self {
                script: Mutex::new(outcomes.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl DeliverySink for ScriptedSink {
        async fn deliver(&self, _envelope: &TaskEnvelope) -> DeliveryOutcome {
            self.script
                .lock()
                .await
                .pop_front()
                .expect("sink script exhausted")
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            group: GROUP.to_string(),
            retry: RetryPolicy::default().without_jitter(),
            ..DispatcherConfig::default()
        }
    }

    fn setup(max_attempts: u32) -> (Arc<MemoryQueue>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (
            Arc::new(MemoryQueue::new(clock.clone(), max_attempts)),
            clock,
        )
    }

    async fn enqueue(queue: &MemoryQueue) -> TaskId {
        queue
            .enqueue(TaskEnvelope::new(GROUP, br#"[{"a":1}]"#.to_vec(), "product-42"))
            .await
            .unwrap()
    }

    /// Run cycles until the task is terminal, advancing the clock to each
    /// retry slot. Returns the observed backoff delays in seconds.
    async fn drain(
        queue: &MemoryQueue,
        sink: &dyn DeliverySink,
        clock: &ManualClock,
        config: &DispatcherConfig,
        id: TaskId,
    ) -> Vec<i64> {
        let mut delays = Vec::new();
        for _ in 0..32 {
            process_batch(queue, sink, config).await.unwrap();
            let record = queue.status(id).await.unwrap().unwrap();
            if record.state.is_terminal() {
                return delays;
            }
            let wait = record.next_attempt_at - clock.now();
            delays.push(wait.num_seconds());
            clock.advance(wait + chrono::Duration::seconds(1));
        }
        panic!("task never reached a terminal state");
    }

    #[tokio::test]
    async fn healthy_sink_succeeds_in_one_cycle() {
        let (queue, _clock) = setup(5);
        let sink = ScriptedSink::new([DeliveryOutcome::status(200, "ok")]);
        let id = enqueue(&queue).await;

        process_batch(queue.as_ref(), &sink, &config())
            .await
            .unwrap();

        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_with_growing_backoff_then_succeed() {
        let (queue, clock) = setup(5);
        let sink = ScriptedSink::new([
            DeliveryOutcome::status(500, ""),
            DeliveryOutcome::status(500, ""),
            DeliveryOutcome::status(500, ""),
            DeliveryOutcome::status(200, ""),
        ]);
        let id = enqueue(&queue).await;

        let cfg = config();
        let delays = drain(queue.as_ref(), &sink, &clock, &cfg, id).await;

        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.attempt_count, 4);
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[tokio::test]
    async fn persistent_failure_dead_letters_after_budget() {
        let (queue, clock) = setup(3);
        let sink = ScriptedSink::new(vec![DeliveryOutcome::status(503, "unavailable"); 3]);
        let id = enqueue(&queue).await;

        let cfg = config();
        drain(queue.as_ref(), &sink, &clock, &cfg, id).await;

        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::DeadLettered);
        assert_eq!(record.attempt_count, 3);
        assert!(record.last_error.unwrap().contains("503"));

        // Dead-lettered tasks are never leased again.
        clock.advance(chrono::Duration::days(7));
        assert_eq!(
            process_batch(queue.as_ref(), &sink, &cfg).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn transport_errors_are_retriable() {
        let (queue, clock) = setup(5);
        let sink = ScriptedSink::new([
            DeliveryOutcome::transport("connection refused"),
            DeliveryOutcome::status(200, ""),
        ]);
        let id = enqueue(&queue).await;

        drain(queue.as_ref(), &sink, &clock, &config(), id).await;
        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn fast_fail_policy_dead_letters_client_errors_immediately() {
        let (queue, _clock) = setup(5);
        let sink = ScriptedSink::new([DeliveryOutcome::status(404, "no such hook")]);
        let id = enqueue(&queue).await;

        let mut cfg = config();
        cfg.fast_fail_client_errors = true;
        process_batch(queue.as_ref(), &sink, &cfg).await.unwrap();

        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::DeadLettered);
        assert_eq!(record.attempt_count, 1);
        assert!(record.last_error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn crashed_worker_is_recovered_by_stale_lease_release() {
        let (queue, clock) = setup(5);
        let sink = ScriptedSink::new([DeliveryOutcome::status(200, "")]);
        let id = enqueue(&queue).await;

        // Simulate a worker that leased and then died: no ack.
        let leased = queue.lease(GROUP, 1).await.unwrap();
        assert_eq!(leased.len(), 1);

        clock.advance(chrono::Duration::seconds(31));
        let reclaimed = queue
            .release_stale_leases(Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        process_batch(queue.as_ref(), &sink, &config())
            .await
            .unwrap();
        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn spawned_dispatcher_drains_the_queue() {
        let clock = Arc::new(SystemClock);
        let queue = Arc::new(MemoryQueue::new(clock, 5));
        let sink = Arc::new(ScriptedSink::new([DeliveryOutcome::status(200, "")]));
        let id = enqueue(&queue).await;

        let dispatcher = Dispatcher::spawn(
            queue.clone(),
            sink,
            DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                ..config()
            },
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let record = queue.status(id).await.unwrap().unwrap();
            if record.state == TaskState::Succeeded {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never succeeded");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        dispatcher.shutdown_and_join().await;
    }
}
