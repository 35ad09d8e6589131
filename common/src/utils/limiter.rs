use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Scheduling class of a model or embedding call. Query-time work outranks
/// background ingestion so interactive requests are not starved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

struct Waiter {
    priority: Priority,
    seq: u64,
    notify: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence number (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct LimiterState {
    available: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

/// Bounded-concurrency gate that hands free slots to the highest-priority
/// waiter.
pub struct PriorityLimiter {
    capacity: usize,
    state: Mutex<LimiterState>,
}

impl PriorityLimiter {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            capacity,
            state: Mutex::new(LimiterState {
                available: capacity,
                next_seq: 0,
                waiters: BinaryHeap::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.lock_state().available
    }

    pub fn queued(&self) -> usize {
        self.lock_state().waiters.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub async fn acquire(self: &Arc<Self>, priority: Priority) -> LimiterPermit {
        let receiver = {
            let mut state = self.lock_state();
            if state.available > 0 && state.waiters.is_empty() {
                state.available = state.available.saturating_sub(1);
                return LimiterPermit {
                    limiter: Arc::clone(self),
                };
            }
            let (notify, receiver) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq = state.next_seq.wrapping_add(1);
            state.waiters.push(Waiter {
                priority,
                seq,
                notify,
            });
            receiver
        };

        let mut pending = PendingAcquire {
            limiter: Arc::clone(self),
            receiver,
            granted: false,
        };
        // The sender is only dropped after a successful send or when the
        // limiter itself goes away, in which case the slot is moot.
        let _ = (&mut pending.receiver).await;
        pending.granted = true;
        LimiterPermit {
            limiter: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut state = self.lock_state();
        while let Some(waiter) = state.waiters.pop() {
            if waiter.notify.send(()).is_ok() {
                return;
            }
        }
        state.available = state.available.saturating_add(1).min(self.capacity);
    }
}

/// Returns the slot if the acquiring task is dropped after being granted one
/// but before it observed the grant.
struct PendingAcquire {
    limiter: Arc<PriorityLimiter>,
    receiver: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.receiver.close();
        if self.receiver.try_recv().is_ok() {
            self.limiter.release();
        }
    }
}

/// Held for the duration of one call; the slot is handed on when dropped.
pub struct LimiterPermit {
    limiter: Arc<PriorityLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn grants_up_to_capacity_immediately() {
        let limiter = PriorityLimiter::new(2);
        let first = limiter.acquire(Priority::Low).await;
        let _second = limiter.acquire(Priority::Low).await;
        assert_eq!(limiter.available(), 0);
        drop(first);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn high_priority_waiters_are_served_first() {
        let limiter = PriorityLimiter::new(1);
        let held = limiter.acquire(Priority::Low).await;
        let order = Arc::new(AsyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (label, priority) in [
            ("low", Priority::Low),
            ("normal", Priority::Normal),
            ("high", Priority::High),
        ] {
            let task_limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = task_limiter.acquire(priority).await;
                order.lock().await.push(label);
            }));
            // Make sure each waiter is queued before the next one.
            while limiter.queued() < handles.len() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        drop(held);
        for handle in handles {
            handle.await.expect("waiter task");
        }
        assert_eq!(*order.lock().await, vec!["high", "normal", "low"]);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn abandoned_waiters_do_not_leak_slots() {
        let limiter = PriorityLimiter::new(1);
        let held = limiter.acquire(Priority::Low).await;
        let waiting = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _permit = limiter.acquire(Priority::High).await;
            })
        };
        while limiter.queued() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        waiting.abort();
        let _ = waiting.await;
        drop(held);
        assert_eq!(limiter.available(), 1);
    }
}
