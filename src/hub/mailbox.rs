use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::StreamEvent;

/// Pending events kept per subscriber before the oldest are dropped.
pub(crate) const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Bounded per-subscriber queue.
///
/// Publishers never wait: when the subscriber falls behind, the oldest queued
/// event is dropped to make room. Every update is a full snapshot, so the
/// newest event is always enough to catch up.
pub(crate) struct Mailbox<T> {
    queue: Mutex<VecDeque<StreamEvent<T>>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    /// Receiving task has stopped
    closed: AtomicBool,
    /// Publisher side dropped this subscriber
    disconnected: AtomicBool,
}

impl<T> Mailbox<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(8))),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Enqueues `event`. Returns false once the receiving side has gone away.
    pub(crate) fn push(&self, event: StreamEvent<T>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }

        self.notify.notify_one();
        true
    }

    /// Waits for the next event. `None` once the queue is drained and the
    /// publisher has disconnected.
    pub(crate) async fn recv(&self) -> Option<StreamEvent<T>> {
        loop {
            if let Some(event) = self.queue.lock().pop_front() {
                return Some(event);
            }
            if self.disconnected.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Called by the publisher when it forgets this subscriber.
    pub(crate) fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Number of events dropped since the last call.
    pub(crate) fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Marks the receiving side gone; later pushes are refused.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
