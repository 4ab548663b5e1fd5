//! In-memory FIFO queues shared between the bridge workers.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::sync::Notify;

/// Thread-safe FIFO with an async blocking pop.
///
/// `push` never blocks and may be called from synchronous code; consumers
/// park on `pop` instead of polling for emptiness.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Notify,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock cannot leave a VecDeque half-updated.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the tail and wake one waiting consumer.
    pub fn push(&self, item: T) {
        self.items().push_back(item);
        self.ready.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items().pop_front()
    }

    /// Wait until an item is available and take it from the head.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.pop()).await.ok()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

/// Bounded log of the most recent items; the oldest entry is evicted first.
#[derive(Debug)]
pub struct BoundedLog<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T: Clone> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Record `item`, returning the evicted entry if the log was full.
    pub fn push(&self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let evicted = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        evicted
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Number of tasks accepted but not yet settled, with an async wait for zero.
///
/// Covers work that sits in no queue: a task being sent, or one waiting on
/// its backoff timer before it is requeued.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Settle one task. Extra calls are ignored.
    pub fn finish(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until every begun task has been settled.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.get() == 0 {
                return;
            }
            idle.await;
        }
    }
}
