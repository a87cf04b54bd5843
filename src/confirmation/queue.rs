//! In-memory work queue of unconfirmed transactions
//!
//! Holds external tx hashes only; the store keeps the records. Producers are
//! the scanner and the signing coordinator, the consumer is the confirmation
//! task. A hash is queued at most once.

use std::collections::{HashSet, VecDeque};

use tokio::sync::{watch, Mutex};

#[derive(Default)]
struct QueueInner {
    order: VecDeque<String>,
    members: HashSet<String>,
}

pub struct UnconfirmedQueue {
    inner: Mutex<QueueInner>,
    loaded: watch::Sender<bool>,
}

impl Default for UnconfirmedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UnconfirmedQueue {
    pub fn new() -> Self {
        let (loaded, _) = watch::channel(false);
        Self {
            inner: Mutex::new(QueueInner::default()),
            loaded,
        }
    }

    /// Append `hash` unless it is already queued. Returns whether it was added.
    pub async fn push(&self, hash: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.members.insert(hash.to_string()) {
            return false;
        }
        inner.order.push_back(hash.to_string());
        true
    }

    pub async fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let hash = inner.order.pop_front()?;
        inner.members.remove(&hash);
        Some(hash)
    }

    pub async fn contains(&self, hash: &str) -> bool {
        self.inner.lock().await.members.contains(hash)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.inner.lock().await.order.iter().cloned().collect()
    }

    /// One-time startup fill from the store, then open the load barrier
    pub async fn load<I>(&self, hashes: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = 0;
        {
            let mut inner = self.inner.lock().await;
            for hash in hashes {
                if inner.members.insert(hash.clone()) {
                    inner.order.push_back(hash);
                    added += 1;
                }
            }
        }
        self.loaded.send_replace(true);
        added
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Wait until [`UnconfirmedQueue::load`] has run
    pub async fn wait_loaded(&self) {
        let mut rx = self.loaded.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|loaded| *loaded).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_fifo_and_dedupe() {
        let queue = UnconfirmedQueue::new();
        assert!(queue.push("a").await);
        assert!(queue.push("b").await);
        assert!(!queue.push("a").await);
        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.pop().await.as_deref(), Some("a"));
        // Popped hashes may be queued again
        assert!(queue.push("a").await);
        assert_eq!(queue.snapshot().await, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_load_barrier() {
        let queue = UnconfirmedQueue::new();
        assert!(!queue.is_loaded());

        let mut waiter = task::spawn(queue.wait_loaded());
        assert_pending!(waiter.poll());

        let added = queue.load(vec!["x".to_string(), "x".to_string(), "y".to_string()]).await;
        assert_eq!(added, 2);
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
        assert!(queue.is_loaded());
        assert_eq!(queue.len().await, 2);

        // Later waiters pass straight through
        assert_ready!(task::spawn(queue.wait_loaded()).poll());
    }
}
