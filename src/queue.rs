use crate::types::NotificationTask;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::warn;

/// Bounded handoff between the ledger and the dispatcher workers.
///
/// The producer side belongs to ingestion, so it must never park for good:
/// when the queue is full it waits briefly for a consumer, then sheds the
/// oldest task and takes its slot. Shedding is counted and logged; the shed
/// task stays persisted and will be re-enqueued on the next restart.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

struct Inner {
    deque: Mutex<VecDeque<NotificationTask>>,
    capacity: usize,
    block_for: Duration,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
    shed: AtomicU64,
}

impl TaskQueue {
    pub fn new(capacity: usize, block_for: Duration) -> Self {
        TaskQueue {
            inner: Arc::new(Inner {
                deque: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                block_for,
                readable: Notify::new(),
                writable: Notify::new(),
                closed: AtomicBool::new(false),
                shed: AtomicU64::new(0),
            }),
        }
    }

    fn try_push(&self, task: NotificationTask) -> Option<NotificationTask> {
        let mut deque = self.inner.deque.lock().expect("queue mutex poisoned");
        if deque.len() < self.inner.capacity {
            deque.push_back(task);
            drop(deque);
            self.inner.readable.notify_one();
            None
        } else {
            Some(task)
        }
    }

    pub async fn push(&self, task: NotificationTask) {
        let task = match self.try_push(task) {
            None => return,
            Some(task) => task,
        };

        // Full: give the consumers one short chance to make room.
        let _ = timeout(self.inner.block_for, self.inner.writable.notified()).await;
        let task = match self.try_push(task) {
            None => return,
            Some(task) => task,
        };

        let mut deque = self.inner.deque.lock().expect("queue mutex poisoned");
        if let Some(dropped) = deque.pop_front() {
            self.inner.shed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Notification queue full, shedding oldest task for {:?}",
                dropped.address
            );
        }
        deque.push_back(task);
        drop(deque);
        self.inner.readable.notify_one();
    }

    /// Next task, or None once the queue is closed and drained.
    pub async fn pop(&self) -> Option<NotificationTask> {
        loop {
            // Register interest before checking, so a push or close landing
            // in between cannot be missed.
            let mut notified = std::pin::pin!(self.inner.readable.notified());
            notified.as_mut().enable();
            {
                let mut deque = self.inner.deque.lock().expect("queue mutex poisoned");
                if let Some(task) = deque.pop_front() {
                    drop(deque);
                    self.inner.writable.notify_one();
                    return Some(task);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting the queue as live; consumers drain what is left.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.readable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.deque.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shed_count(&self) -> u64 {
        self.inner.shed.load(Ordering::Relaxed)
    }
}
