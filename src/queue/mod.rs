//! Bounded multi-priority queue used between engine stages.
//!
//! Higher numeric priority dequeues first; within a priority level order is
//! FIFO. Total capacity is fixed across all priorities, which makes the
//! queue the engine's backpressure signal: a full queue blocks writers until
//! a reader drains it.
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::Error;

struct Levels<T> {
    // sorted by priority descending; small and scanned linearly
    levels: Vec<(usize, VecDeque<T>)>,
    len: usize,
    closed: bool,
}

impl<T> Levels<T> {
    fn push(&mut self, item: T, priority: usize) {
        match self.levels.iter_mut().find(|(p, _)| *p == priority) {
            Some((_, level)) => level.push_back(item),
            None => {
                let position = self
                    .levels
                    .iter()
                    .position(|(p, _)| *p < priority)
                    .unwrap_or(self.levels.len());
                let mut level = VecDeque::new();
                level.push_back(item);
                self.levels.insert(position, (priority, level));
            }
        }
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        for (_, level) in self.levels.iter_mut() {
            if let Some(item) = level.pop_front() {
                self.len -= 1;
                return Some(item);
            }
        }
        None
    }
}

/// Multi-priority FIFO with a fixed total capacity shared by all priorities.
pub struct PriorityQueue<T> {
    inner: Mutex<Levels<T>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl<T> PriorityQueue<T> {
    /// Creates a queue holding at most `capacity` items across all
    /// priorities.
    pub fn new(capacity: usize) -> Self {
        PriorityQueue {
            inner: Mutex::new(Levels {
                levels: Vec::new(),
                len: 0,
                closed: false,
            }),
            capacity: capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueues at the given priority, waiting for capacity to free. A queue
    /// closed before the item lands hands it back through `Err`.
    pub async fn enqueue(&self, item: T, priority: usize) -> Result<(), T> {
        let mut item = Some(item);
        loop {
            let waiter = self.writable.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            {
                let mut guard = self.inner.lock().expect("queue lock poisoned");
                if guard.closed {
                    return Err(item.take().expect("item present"));
                }
                if guard.len < self.capacity {
                    guard.push(item.take().expect("item present"), priority);
                    drop(guard);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            waiter.await;
        }
    }

    /// Enqueues immediately, allowing the queue to exceed its capacity. Used
    /// for re-entries that must not wait behind the writers they unblock.
    /// Fails only when the queue is closed.
    pub fn force_enqueue(&self, item: T, priority: usize) -> Result<(), T> {
        {
            let mut guard = self.inner.lock().expect("queue lock poisoned");
            if guard.closed {
                return Err(item);
            }
            guard.push(item, priority);
        }
        self.readable.notify_one();
        Ok(())
    }

    /// Dequeues the highest-priority item, waiting until one is available.
    /// Fails with [Error::QueueClosed] once the queue is closed and drained.
    pub async fn dequeue(&self) -> Result<T, Error> {
        loop {
            let waiter = self.readable.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            {
                let mut guard = self.inner.lock().expect("queue lock poisoned");
                if let Some(item) = guard.pop() {
                    drop(guard);
                    self.writable.notify_one();
                    return Ok(item);
                }
                if guard.closed {
                    return Err(Error::QueueClosed);
                }
            }
            waiter.await;
        }
    }

    /// Applies `op` to every queued item matching `predicate`, in place and
    /// without consuming queue positions.
    pub fn update<P, F>(&self, predicate: P, mut op: F)
    where
        P: Fn(&T) -> bool,
        F: FnMut(&mut T),
    {
        let mut guard = self.inner.lock().expect("queue lock poisoned");
        for (_, level) in guard.levels.iter_mut() {
            for item in level.iter_mut() {
                if predicate(item) {
                    op(item);
                }
            }
        }
    }

    /// Closes the queue: pending writers complete with `false`, readers drain
    /// the remaining items and then receive [Error::QueueClosed].
    pub fn close(&self) {
        {
            let mut guard = self.inner.lock().expect("queue lock poisoned");
            guard.closed = true;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").closed
    }

    /// Number of items currently queued across all priorities.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn fifo_within_priority() {
        let queue = PriorityQueue::new(10);
        assert!(queue.enqueue(1, 0).await.is_ok());
        assert!(queue.enqueue(2, 0).await.is_ok());
        assert!(queue.enqueue(3, 0).await.is_ok());
        assert_eq!(queue.dequeue().await.expect("item"), 1);
        assert_eq!(queue.dequeue().await.expect("item"), 2);
        assert_eq!(queue.dequeue().await.expect("item"), 3);
    }

    #[tokio::test]
    async fn higher_priority_first() {
        let queue = PriorityQueue::new(10);
        assert!(queue.enqueue("low-a", 0).await.is_ok());
        assert!(queue.enqueue("high", 1).await.is_ok());
        assert!(queue.enqueue("low-b", 0).await.is_ok());
        assert_eq!(queue.dequeue().await.expect("item"), "high");
        assert_eq!(queue.dequeue().await.expect("item"), "low-a");
        assert_eq!(queue.dequeue().await.expect("item"), "low-b");
    }

    #[tokio::test]
    async fn enqueue_blocks_on_full_until_dequeue() {
        let queue = Arc::new(PriorityQueue::new(1));
        assert!(queue.enqueue(1, 0).await.is_ok());

        let writer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(2, 0).await })
        };
        // writer cannot proceed while the queue is full
        sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        assert_eq!(queue.dequeue().await.expect("item"), 1);
        assert!(writer.await.expect("join").is_ok());
        assert_eq!(queue.dequeue().await.expect("item"), 2);
    }

    #[tokio::test]
    async fn dequeue_blocks_on_empty_until_enqueue() {
        let queue = Arc::new(PriorityQueue::new(4));
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        assert!(queue.enqueue(7, 0).await.is_ok());
        assert_eq!(reader.await.expect("join").expect("item"), 7);
    }

    #[tokio::test]
    async fn close_wakes_blocked_writer() {
        let queue = Arc::new(PriorityQueue::new(1));
        assert!(queue.enqueue(1, 0).await.is_ok());
        let writer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(2, 0).await })
        };
        sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(writer.await.expect("join").is_err());
    }

    #[tokio::test]
    async fn close_wakes_blocked_reader() {
        let queue: Arc<PriorityQueue<u64>> = Arc::new(PriorityQueue::new(4));
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(matches!(
            reader.await.expect("join"),
            Err(Error::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn enqueue_after_close_returns_false() {
        let queue = PriorityQueue::new(4);
        queue.close();
        assert!(queue.enqueue(1, 0).await.is_err());
    }

    #[tokio::test]
    async fn close_drains_before_erroring() {
        let queue = PriorityQueue::new(4);
        assert!(queue.enqueue(1, 0).await.is_ok());
        assert!(queue.enqueue(2, 1).await.is_ok());
        queue.close();
        assert_eq!(queue.dequeue().await.expect("item"), 2);
        assert_eq!(queue.dequeue().await.expect("item"), 1);
        assert!(matches!(queue.dequeue().await, Err(Error::QueueClosed)));
    }

    #[tokio::test]
    async fn update_mutates_in_place() {
        let queue = PriorityQueue::new(4);
        assert!(queue.enqueue(1, 0).await.is_ok());
        assert!(queue.enqueue(2, 0).await.is_ok());
        assert!(queue.enqueue(3, 1).await.is_ok());
        queue.update(|item| item % 2 == 1, |item| *item += 10);
        assert_eq!(queue.dequeue().await.expect("item"), 13);
        assert_eq!(queue.dequeue().await.expect("item"), 11);
        assert_eq!(queue.dequeue().await.expect("item"), 2);
    }

    #[tokio::test]
    async fn force_enqueue_ignores_capacity() {
        let queue = PriorityQueue::new(1);
        assert!(queue.enqueue(1, 0).await.is_ok());
        assert!(queue.force_enqueue(2, 1).is_ok());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().await.expect("item"), 2);
        assert_eq!(queue.dequeue().await.expect("item"), 1);

        queue.close();
        assert!(queue.force_enqueue(3, 0).is_err());
    }

    #[tokio::test]
    async fn many_writers_drain() {
        let queue = Arc::new(PriorityQueue::new(2));
        let mut writers = Vec::new();
        for i in 0..20u64 {
            let queue = Arc::clone(&queue);
            writers.push(tokio::spawn(async move { queue.enqueue(i, 0).await }));
        }
        let mut seen = Vec::new();
        for _ in 0..20 {
            seen.push(
                timeout(Duration::from_secs(1), queue.dequeue())
                    .await
                    .expect("no deadlock")
                    .expect("item"),
            );
        }
        for writer in writers {
            assert!(writer.await.expect("join").is_ok());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }
}
