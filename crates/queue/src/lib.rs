//! `queue` crate: the in-process ready-queue shared by the engine and its
//! worker units.
//!
//! Producers push from any task; every worker unit awaits [`ReadyQueue::pop`]
//! on the same queue. Items come out in FIFO order, so the order in which the
//! engine enqueues ready steps is the order in which they are dispatched.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::trace;

/// Unbounded multi-producer/multi-consumer FIFO queue.
#[derive(Debug)]
pub struct ReadyQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadyQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake one waiting consumer.
    pub fn push(&self, item: T) {
        let depth = {
            let mut items = self.items();
            items.push_back(item);
            items.len()
        };
        trace!(depth, "item enqueued");
        self.available.notify_one();
    }

    /// Append several items, preserving their order.
    pub fn extend(&self, batch: impl IntoIterator<Item = T>) {
        for item in batch {
            self.push(item);
        }
    }

    /// Take the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items().pop_front()
    }

    /// Take the oldest item, waiting until one is available.
    ///
    /// Cancel-safe: an item is only removed when the future completes, so
    /// dropping it inside `tokio::select!` never loses an item.
    pub async fn pop(&self) -> T {
        loop {
            let (item, remaining) = {
                let mut items = self.items();
                let item = items.pop_front();
                (item, items.len())
            };
            if let Some(item) = item {
                // Notify holds a single permit; pass the wakeup on while
                // work is left so no consumer sleeps on a non-empty queue.
                if remaining > 0 {
                    self.available.notify_one();
                }
                return item;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn items_come_out_in_fifo_order() {
        let queue = ReadyQueue::new();
        queue.extend(["a", "b", "c"]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await, "a");
        assert_eq!(queue.pop().await, "b");
        assert_eq!(queue.try_pop(), Some("c"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_waits_for_a_producer() {
        let queue = Arc::new(ReadyQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.push(7u32);
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert_eq!(got, 7);
    }

    #[tokio::test]
    async fn every_item_reaches_exactly_one_consumer() {
        let queue = Arc::new(ReadyQueue::new());
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..25 {
                    got.push(queue.pop().await);
                }
                got
            }));
        }

        for i in 0..100u32 {
            queue.push(i);
        }

        let mut all = Vec::new();
        for consumer in consumers {
            let got = tokio::time::timeout(Duration::from_secs(2), consumer)
                .await
                .expect("consumers should drain the queue")
                .unwrap();
            all.extend(got);
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dropped_pop_does_not_lose_items() {
        let queue = ReadyQueue::new();
        let res = tokio::time::timeout(Duration::from_millis(10), queue.pop()).await;
        assert!(res.is_err());

        queue.push("late");
        assert_eq!(queue.pop().await, "late");
    }
}
