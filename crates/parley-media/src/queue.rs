//! Bounded drop-oldest queue with a single async consumer.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; its oldest item was evicted to make room.
    DroppedOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("queue is closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Producers never block; when full, the oldest item is discarded. Only one
/// task may await [`FrameQueue::pop`] at a time.
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, item: T) -> Result<PushOutcome, QueueClosed> {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueClosed);
            }
            let outcome = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.dropped += 1;
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            inner.items.push_back(item);
            outcome
        };
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Next item, waiting if empty. `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Stop accepting items. Already queued items can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Discard everything queued; returns how many items were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.items.len();
        inner.items.clear();
        n
    }

    /// Keep only items matching `keep`; returns how many were removed.
    pub fn retain(&self, keep: impl FnMut(&T) -> bool) -> usize {
        let mut inner = self.lock();
        let before = inner.items.len();
        inner.items.retain(keep);
        before - inner.items.len()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted by drop-oldest since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
