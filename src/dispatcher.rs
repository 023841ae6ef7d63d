use crate::notify::Notifier;
use crate::queue::TaskQueue;
use crate::repository::LedgerStore;
use crate::status::ScannerStatus;
use crate::types::NotificationTask;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

/// Per-task retry budget. With the defaults an attempt sequence is spaced
/// roughly 500ms, 1s, 2s, ... capped at `backoff_max`.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_factor: u64,
    pub backoff_max: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy {
            max_attempts: 6,
            backoff_base_ms: 2,
            backoff_factor: 250,
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Delivers queued notification tasks at-least-once.
///
/// Failures stay inside the worker that hit them: a task is retried with
/// backoff, then dead-lettered, and ingestion never hears about either.
pub struct Dispatcher {
    queue: TaskQueue,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn LedgerStore>,
    status: Arc<ScannerStatus>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        queue: TaskQueue,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn LedgerStore>,
        status: Arc<ScannerStatus>,
        policy: DispatchPolicy,
    ) -> Self {
        Dispatcher {
            queue,
            notifier,
            store,
            status,
            policy,
        }
    }

    /// Start the worker pool. Workers exit once the queue is closed and
    /// drained, so joining the handles is the shutdown drain.
    pub fn spawn(self: &Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|id| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move { dispatcher.run_worker(id).await })
            })
            .collect()
    }

    async fn run_worker(&self, id: usize) {
        while let Some(task) = self.queue.pop().await {
            self.dispatch(task).await;
        }
        debug!("Notification worker {} drained", id);
    }

    async fn dispatch(&self, mut task: NotificationTask) {
        let strategy = ExponentialBackoff::from_millis(self.policy.backoff_base_ms)
            .factor(self.policy.backoff_factor)
            .max_delay(self.policy.backoff_max)
            .map(jitter)
            .take(self.policy.max_attempts.saturating_sub(1));

        let attempts = AtomicU32::new(0);
        let result = Retry::spawn(strategy, || {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.notifier.deliver(&task)
        })
        .await;
        task.attempts = attempts.load(Ordering::Relaxed);

        match result {
            Ok(()) => {
                debug!(
                    "Delivered notification for {:?} after {} attempt(s)",
                    task.address, task.attempts
                );
                self.ack(&task, true).await;
            }
            Err(e) => {
                warn!(
                    "Giving up on notification for {:?} after {} attempts: {}",
                    task.address, task.attempts, e
                );
                self.status.record_dead_letter();
                self.ack(&task, false).await;
            }
        }
    }

    async fn ack(&self, task: &NotificationTask, delivered: bool) {
        let store = Arc::clone(&self.store);
        let key = task.key;
        // Database operations are blocking.
        let result = tokio::task::spawn_blocking(move || {
            if delivered {
                store.mark_task_delivered(&key)
            } else {
                store.mark_task_dead_letter(&key)
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to record task outcome: {}", e),
            Err(e) => warn!("Task outcome writer panicked: {}", e),
        }
    }
}
