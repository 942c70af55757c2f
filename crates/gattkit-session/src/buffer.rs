//! Bounded per-subscription notification buffer.
//!
//! The producer side (`push`) never blocks and never fails: at capacity the
//! oldest entry is evicted and the cumulative `dropped` counter grows. The
//! consumer side offers three strategies over the same queue: `poll` takes
//! what is there, `wait` blocks for one entry, `drain` collects a burst.
//! Every consumption call removes what it returns.

use std::collections::VecDeque;
use std::time::Duration;

use gattkit_protocol::Notification;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The buffer was closed; the entry was discarded.
    Closed,
    /// Stored. `alert` is set for the first entry since the last consumption call.
    Stored { alert: bool },
}

/// Entries removed by one consumption call, with the cumulative drop count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub entries: Vec<Notification>,
    pub dropped: u64,
}

#[derive(Debug)]
struct BufferState {
    entries: VecDeque<Notification>,
    dropped: u64,
    closed: bool,
    alert_armed: bool,
}

#[derive(Debug)]
pub struct NotificationBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    arrived: Notify,
}

impl NotificationBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BufferState {
                entries: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: false,
                alert_armed: true,
            }),
            arrived: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn push(&self, notification: Notification) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.entries.len() >= self.capacity {
                state.entries.pop_front();
                state.dropped += 1;
            }
            state.entries.push_back(notification);
            let alert = std::mem::replace(&mut state.alert_armed, false);
            PushOutcome::Stored { alert }
        };
        self.arrived.notify_waiters();
        outcome
    }

    /// Freeze the buffer: pending entries are discarded and later pushes ignored.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.entries.clear();
        }
        self.arrived.notify_waiters();
    }

    /// Remove up to `max_items` of the oldest entries without waiting.
    pub fn poll(&self, max_items: usize) -> Batch {
        let mut state = self.state.lock();
        let take = max_items.min(state.entries.len());
        let entries = state.entries.drain(..take).collect();
        state.alert_armed = true;
        Batch {
            entries,
            dropped: state.dropped,
        }
    }

    /// Remove the oldest entry, waiting up to `timeout` for one to arrive.
    pub async fn wait(&self, timeout: Duration) -> Option<Notification> {
        let entry = self.next_before(Instant::now() + timeout).await;
        self.rearm();
        entry
    }

    /// Wait up to `timeout` for a first entry, then keep collecting until an
    /// idle gap longer than `idle_timeout`, `max_items` entries, or the overall
    /// `timeout` is spent.
    pub async fn drain(&self, timeout: Duration, idle_timeout: Duration, max_items: usize) -> Batch {
        let deadline = Instant::now() + timeout;
        let mut entries = Vec::new();
        if let Some(first) = self.next_before(deadline).await {
            entries.push(first);
            while entries.len() < max_items {
                let idle_deadline = (Instant::now() + idle_timeout).min(deadline);
                match self.next_before(idle_deadline).await {
                    Some(entry) => entries.push(entry),
                    None => break,
                }
            }
        }
        let mut state = self.state.lock();
        state.alert_armed = true;
        Batch {
            entries,
            dropped: state.dropped,
        }
    }

    async fn next_before(&self, deadline: Instant) -> Option<Notification> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the await is not missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(entry) = state.entries.pop_front() {
                    return Some(entry);
                }
                if state.closed {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn rearm(&self) {
        self.state.lock().alert_armed = true;
    }
}
