//! Subscription-based status notification bus
//!
//! Replaces callback-style notification with explicit subscriptions:
//! each subscriber owns an ordered queue of [`StatusRecord`] transitions.
//! Queues are bounded; overflow sheds the oldest record that is a pure
//! progress update (same status as the record that follows it, and not
//! terminal). A transition `A -> B -> C` therefore remains observable as
//! at least `A, ..., C` in order even under backpressure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::trace;

use crate::status::StatusRecord;

const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct SubscriberQueue {
    queue: Mutex<VecDeque<StatusRecord>>,
    notify: Notify,
    capacity: usize,
    /// Bus dropped; receivers drain what is queued and then see end-of-stream
    closed: AtomicBool,
    /// Receiver dropped; the bus prunes this entry on the next publish
    receiver_alive: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, record: StatusRecord) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            // Shed the oldest coalescible progress update. A record may be
            // dropped only when the following record (or the incoming one)
            // carries the same status, so no transition ever disappears.
            let drop_idx = (0..queue.len()).find(|&i| {
                let next_status = queue.get(i + 1).map_or(record.status, |r| r.status);
                !queue[i].is_terminal() && queue[i].status == next_status
            });
            match drop_idx {
                Some(i) => {
                    queue.remove(i);
                }
                // Every queued record is a distinct transition; grow instead
                // of losing one.
                None => trace!(len = queue.len(), "status queue over capacity"),
            }
        }
        queue.push_back(record);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Fan-out publisher for status records
///
/// Publishing never blocks and never fails; subscribers that fell behind
/// or disappeared are handled per-queue.
pub struct StatusBus {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    capacity: usize,
}

impl StatusBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus whose subscriber queues hold at most `capacity` records
    /// before the shed policy applies.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new observer. Cancellation is dropping the subscription.
    #[must_use]
    pub fn subscribe(&self) -> StatusSubscription {
        let shared = Arc::new(SubscriberQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.capacity,
            closed: AtomicBool::new(false),
            receiver_alive: AtomicBool::new(true),
        });
        self.subscribers.lock().unwrap().push(shared.clone());
        StatusSubscription { shared }
    }

    /// Deliver a record to every live subscriber, in publish order.
    pub fn publish(&self, record: &StatusRecord) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| s.receiver_alive.load(Ordering::Relaxed));
        for subscriber in subscribers.iter() {
            subscriber.push(record.clone());
        }
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StatusBus {
    fn drop(&mut self) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            subscriber.closed.store(true, Ordering::Relaxed);
            subscriber.notify.notify_waiters();
        }
    }
}

/// Receiving end of a [`StatusBus`] subscription
pub struct StatusSubscription {
    shared: Arc<SubscriberQueue>,
}

impl StatusSubscription {
    /// Wait for the next record. Returns `None` once the bus is gone and
    /// all queued records have been drained.
    pub async fn recv(&mut self) -> Option<StatusRecord> {
        loop {
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if let Some(record) = queue.pop_front() {
                    return Some(record);
                }
            }
            if self.shared.closed.load(Ordering::Relaxed) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<StatusRecord> {
        self.shared.queue.lock().unwrap().pop_front()
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::Relaxed);
    }
}
