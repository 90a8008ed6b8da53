//! FIFO demand queue with cancel-by-key.
//!
//! Every entry carries a key. [`ScalingQueue::remove`] invalidates the live
//! entry of a key in O(1) by forgetting its sequence number. Dead entries at
//! the head are dropped right away; the rest are discarded when a dequeue
//! reaches them, or swept once they outnumber the live ones. Enqueueing a key
//! that is already queued supersedes the older entry.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Dead entries tolerated beyond the live count before a full sweep.
const SWEEP_SLACK: usize = 64;

struct Inner<K, T> {
    seq: u64,
    live: HashMap<K, u64>,
    entries: VecDeque<(u64, K, T)>,
}

impl<K: Eq + Hash, T> Inner<K, T> {
    fn prune(&mut self) {
        let Self { live, entries, .. } = self;
        while entries
            .front()
            .is_some_and(|(seq, key, _)| live.get(key) != Some(seq))
        {
            entries.pop_front();
        }
        if entries.len() > live.len() * 2 + SWEEP_SLACK {
            entries.retain(|(seq, key, _)| live.get(key) == Some(seq));
        }
    }
}

/// Queue of items keyed for cancellation before dispatch.
pub struct ScalingQueue<K, T> {
    inner: Mutex<Inner<K, T>>,
    ready: Notify,
}

impl<K, T> Default for ScalingQueue<K, T>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> ScalingQueue<K, T>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                seq: 0,
                live: HashMap::new(),
                entries: VecDeque::new(),
            }),
            ready: Notify::new(),
        }
    }

    /// Append `item` under `key`.
    pub fn enqueue(&self, key: K, item: T) {
        {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let seq = inner.seq;
            inner.live.insert(key.clone(), seq);
            inner.entries.push_back((seq, key, item));
            inner.prune();
        }
        self.ready.notify_one();
    }

    /// Cancel the queued entry of `key`.
    ///
    /// Returns `true` if an entry was queued and will now never be
    /// delivered; `false` if none was (never queued or already dequeued).
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.live.remove(key).is_some();
        if removed {
            inner.prune();
        }
        removed
    }

    /// Pop the oldest live entry without waiting.
    pub fn try_dequeue(&self) -> Option<(K, T)> {
        let mut inner = self.inner.lock();
        while let Some((seq, key, item)) = inner.entries.pop_front() {
            if inner.live.get(&key) == Some(&seq) {
                inner.live.remove(&key);
                inner.prune();
                return Some((key, item));
            }
        }
        None
    }

    /// Wait for and pop the oldest live entry.
    pub async fn dequeue(&self) -> (K, T) {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_dequeue() {
                if !self.is_empty() {
                    self.ready.notify_one();
                }
                return entry;
            }
            notified.await;
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Whether no live entry is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` has a live entry.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().live.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_among_live_entries() {
        let queue = ScalingQueue::new();
        queue.enqueue("a", 1);
        queue.enqueue("b", 2);
        queue.enqueue("c", 3);
        assert!(queue.remove(&"b"));
        assert!(!queue.remove(&"b"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_dequeue(), Some(("a", 1)));
        assert_eq!(queue.try_dequeue(), Some(("c", 3)));
        assert_eq!(queue.try_dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn reenqueue_supersedes_older_entry() {
        let queue = ScalingQueue::new();
        queue.enqueue("a", 1);
        queue.enqueue("b", 2);
        queue.enqueue("a", 3);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_dequeue(), Some(("b", 2)));
        assert_eq!(queue.try_dequeue(), Some(("a", 3)));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn dequeued_key_cannot_be_removed() {
        let queue = ScalingQueue::new();
        queue.enqueue("a", 1);
        assert!(queue.try_dequeue().is_some());
        assert!(!queue.remove(&"a"));
        assert!(!queue.contains(&"a"));
    }

    #[test]
    fn cancelled_entries_do_not_pile_up_without_consumers() {
        let queue = ScalingQueue::new();
        queue.enqueue("stuck", 0);
        for i in 0..1000 {
            queue.enqueue("chain", i);
            assert!(queue.remove(&"chain"));
        }
        queue.enqueue("head", 1);
        assert!(queue.remove(&"head"));

        assert_eq!(queue.len(), 1);
        assert!(queue.inner.lock().entries.len() <= 2 + SWEEP_SLACK);
        assert_eq!(queue.try_dequeue(), Some(("stuck", 0)));
        assert!(queue.inner.lock().entries.is_empty());
    }

    #[test]
    fn removing_the_head_drops_it_at_once() {
        let queue = ScalingQueue::new();
        queue.enqueue("a", 1);
        queue.enqueue("b", 2);
        assert!(queue.remove(&"a"));
        assert_eq!(queue.inner.lock().entries.len(), 1);
    }

    #[tokio::test]
    async fn dequeue_waits_for_enqueue() {
        let queue = Arc::new(ScalingQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        queue.enqueue("a", 7);
        assert_eq!(waiter.await.unwrap(), ("a", 7));
    }

    #[tokio::test(start_paused = true)]
    async fn removed_entry_is_skipped_by_waiting_dequeue() {
        let queue = Arc::new(ScalingQueue::new());
        queue.enqueue("gone", 1);
        queue.remove(&"gone");

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        queue.enqueue("kept", 2);
        assert_eq!(waiter.await.unwrap(), ("kept", 2));
    }

    #[tokio::test]
    async fn every_entry_reaches_exactly_one_consumer() {
        let queue = Arc::new(ScalingQueue::new());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.dequeue().await.1 })
            })
            .collect();

        for i in 0..3 {
            queue.enqueue(i, i * 10);
        }

        let mut got = Vec::new();
        for consumer in consumers {
            got.push(consumer.await.unwrap());
        }
        got.sort_unstable();
        assert_eq!(got, vec![0, 10, 20]);
    }
}
