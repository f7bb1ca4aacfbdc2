//! Bounded 3-level priority wait queue with a drop-lowest overflow policy.
//!
//! Ordered priority bands feed a fixed-concurrency admission gate; enqueue
//! and dequeue are the seam between caller and scheduler.

use std::cmp::Ordering;
use std::collections::VecDeque;

use tokio::sync::{oneshot, Mutex};

use crate::error::{ContentEngineError, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Lower rank sorts first (`High` admits ahead of `Low`).
    fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PriorityQueueConfig {
    pub max_in_flight: usize,
    pub max_waiting: usize,
    pub drop_lowest: bool,
}

struct Waiter {
    priority: Priority,
    resolver: oneshot::Sender<Result<()>>,
}

struct QueueState {
    in_flight: usize,
    waiters: VecDeque<Waiter>,
}

/// Stable FIFO-within-priority admission gate in front of the connection
/// pool. A permit acquired via [`PriorityQueue::enqueue`] must be released
/// with [`PriorityQueue::dequeue`] exactly once, on every exit path
/// (including error paths) — callers use an RAII guard for this.
#[derive(Debug)]
pub struct PriorityQueue {
    config: PriorityQueueConfig,
    state: Mutex<QueueState>,
}

/// RAII admission permit. Dropping it always releases the in-flight slot,
/// so the slot is freed on every exit path including errors.
pub struct Admission<'a> {
    queue: &'a PriorityQueue,
    released: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let queue = self.queue;
            // `Drop` can't be async; spawn the bookkeeping so slots are
            // reclaimed promptly without blocking the dropping task.
            tokio::spawn(async move {
                queue.dequeue().await;
            });
        }
    }
}

impl PriorityQueue {
    pub fn new(config: PriorityQueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState {
                in_flight: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Admits immediately if below `max_in_flight`; otherwise waits in a
    /// priority-sorted, FIFO-within-priority queue, subject to
    /// `max_waiting` and the drop-lowest overflow policy.
    pub async fn enqueue(&self, priority: Priority) -> Result<Admission<'_>> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.in_flight < self.config.max_in_flight {
                state.in_flight += 1;
                None
            } else if state.waiters.len() < self.config.max_waiting {
                let (tx, rx) = oneshot::channel();
                insert_sorted(&mut state.waiters, Waiter { priority, resolver: tx });
                Some(rx)
            } else if self.config.drop_lowest
                && state
                    .waiters
                    .back()
                    .is_some_and(|w| w.priority > priority)
            {
                // Reject the dropped waiter synchronously, before this
                // enqueue's own admission bookkeeping.
                let dropped = state.waiters.pop_back().expect("checked non-empty above");
                let _ = dropped.resolver.send(Err(ContentEngineError::QueueFull));
                let (tx, rx) = oneshot::channel();
                insert_sorted(&mut state.waiters, Waiter { priority, resolver: tx });
                Some(rx)
            } else {
                return Err(ContentEngineError::QueueFull);
            }
        };

        if let Some(rx) = rx {
            rx.await.map_err(|_| {
                ContentEngineError::Internal("priority queue waiter dropped without resolution".into())
            })??;
        }

        Ok(Admission { queue: self, released: false })
    }

    /// Decrements the in-flight count and admits the head waiter, if any.
    pub async fn dequeue(&self) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(waiter) = state.waiters.pop_front() {
            state.in_flight += 1;
            let _ = waiter.resolver.send(Ok(()));
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight
    }

    pub async fn waiting(&self) -> usize {
        self.state.lock().await.waiters.len()
    }
}

/// Stable insert-by-priority: within a priority, later arrivals land after
/// earlier ones (FIFO).
fn insert_sorted(waiters: &mut VecDeque<Waiter>, waiter: Waiter) {
    let pos = waiters
        .iter()
        .position(|w| w.priority > waiter.priority)
        .unwrap_or(waiters.len());
    waiters.insert(pos, waiter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_immediately_under_capacity() {
        let queue = PriorityQueue::new(PriorityQueueConfig {
            max_in_flight: 2,
            max_waiting: 2,
            drop_lowest: false,
        });
        let _a = queue.enqueue(Priority::Low).await.unwrap();
        let _b = queue.enqueue(Priority::High).await.unwrap();
        assert_eq!(queue.in_flight().await, 2);
    }

    #[tokio::test]
    async fn rejects_when_full_without_drop_lowest() {
        let queue = PriorityQueue::new(PriorityQueueConfig {
            max_in_flight: 1,
            max_waiting: 1,
            drop_lowest: false,
        });
        let _a = queue.enqueue(Priority::Low).await.unwrap();
        let _b = queue.enqueue(Priority::Low).await.unwrap(); // fills the wait slot
        let err = queue.enqueue(Priority::Low).await.unwrap_err();
        assert!(matches!(err, ContentEngineError::QueueFull));
    }

    #[tokio::test]
    async fn drop_lowest_evicts_lower_priority_waiter() {
        let queue = std::sync::Arc::new(PriorityQueue::new(PriorityQueueConfig {
            max_in_flight: 1,
            max_waiting: 1,
            drop_lowest: true,
        }));
        let holder = queue.enqueue(Priority::Low).await.unwrap();

        let q2 = queue.clone();
        let low_task = tokio::spawn(async move { q2.enqueue(Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.waiting().await, 1);

        let q3 = queue.clone();
        let high_task = tokio::spawn(async move { q3.enqueue(Priority::High).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let low_result = low_task.await.unwrap();
        assert!(
            matches!(low_result, Err(ContentEngineError::QueueFull)),
            "lower-priority waiter must be rejected synchronously once evicted"
        );
        assert_eq!(queue.waiting().await, 1, "high-priority waiter took the freed slot");

        drop(holder);
        let high_result = tokio::time::timeout(Duration::from_millis(200), high_task)
            .await
            .expect("high priority admission should resolve once the in-flight slot frees")
            .unwrap();
        assert!(high_result.is_ok());
    }
}
