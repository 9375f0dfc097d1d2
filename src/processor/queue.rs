//! Bounded per-channel mailbox.
//!
//! Events for one channel are processed in arrival order by a single worker;
//! the mailbox is the serialization point. When a channel falls behind beyond
//! the configured depth, the OLDEST queued event is dropped - current context
//! beats stale context - and the caller records a drop metric.

use crate::chat::ChatEvent;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Outcome of enqueueing an event.
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// The mailbox was full; this event was evicted to make room.
    DroppedOldest(ChatEvent),
    /// The mailbox is closed; the event was discarded.
    Closed,
}

struct Inner {
    queue: VecDeque<ChatEvent>,
    closed: bool,
}

/// FIFO queue with drop-oldest overflow.
pub struct Mailbox {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: ChatEvent) -> PushOutcome {
        let mut inner = self.inner.lock().expect("mailbox lock poisoned");
        if inner.closed {
            return PushOutcome::Closed;
        }
        let dropped = if inner.queue.len() >= self.capacity {
            inner.queue.pop_front()
        } else {
            None
        };
        inner.queue.push_back(event);
        drop(inner);
        self.notify.notify_one();
        match dropped {
            Some(event) => PushOutcome::DroppedOldest(event),
            None => PushOutcome::Queued,
        }
    }

    /// Next event in arrival order; `None` once closed and drained.
    pub async fn recv(&self) -> Option<ChatEvent> {
        loop {
            {
                let mut inner = self.inner.lock().expect("mailbox lock poisoned");
                if let Some(event) = inner.queue.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting events; `recv` drains what is queued, then ends.
    pub fn close(&self) {
        self.inner.lock().expect("mailbox lock poisoned").closed = true;
        self.notify.notify_waiters();
    }
}
