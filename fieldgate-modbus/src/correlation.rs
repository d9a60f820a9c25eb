//! Matching asynchronous responses to their requests.
//!
//! Two shapes exist. Control commands block on a single-use [`WaitHandle`]
//! registered in [`PendingReplies`]; polls are fire-and-forget and park their
//! point group in a bounded [`CorrelationQueue`] until the response decodes.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::ConnectorError;

/// Default number of poll requests awaiting a response per connector.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Delivery side of a wait handle. Only the first value is kept.
#[derive(Debug)]
pub struct Completer<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Completer<T> {
    /// Deliver `value`; returns false if a value was already delivered or the
    /// waiter is gone.
    pub fn set(&self, value: T) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop the sender so the waiter wakes with [`ConnectorError::Closed`].
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

/// Waiting side: consumed by [`WaitHandle::wait`], so it is never reused.
#[derive(Debug)]
pub struct WaitHandle<T> {
    rx: oneshot::Receiver<T>,
    timeout: Duration,
}

impl<T> WaitHandle<T> {
    /// Wait for the value, at most `timeout`.
    pub async fn wait(self) -> Result<T, ConnectorError> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ConnectorError::Closed),
            Err(_) => Err(ConnectorError::DeadlineExceeded),
        }
    }
}

/// A fresh single-slot handle pair.
pub fn wait_handle<T>(timeout: Duration) -> (Completer<T>, WaitHandle<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completer {
            tx: Mutex::new(Some(tx)),
        },
        WaitHandle { rx, timeout },
    )
}

/// Outstanding control requests by correlation key.
#[derive(Debug)]
pub struct PendingReplies<T> {
    inner: Arc<Mutex<HashMap<String, Arc<Completer<T>>>>>,
}

impl<T> Clone for PendingReplies<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for PendingReplies<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> PendingReplies<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait handle under `key`. The registration is removed when
    /// the returned guard drops, whichever way the caller exits.
    pub fn register(&self, key: &str, timeout: Duration) -> (Registration<T>, WaitHandle<T>) {
        let (completer, handle) = wait_handle(timeout);
        let completer = Arc::new(completer);
        if let Some(previous) = self
            .inner
            .lock()
            .insert(key.to_string(), Arc::clone(&completer))
        {
            previous.close();
        }
        (
            Registration {
                key: key.to_string(),
                completer,
                pending: self.clone(),
            },
            handle,
        )
    }

    /// Deliver to the handle waiting on `key`. Hands the value back when no
    /// one is waiting.
    pub fn complete(&self, key: &str, value: T) -> Option<T> {
        let completer = self.inner.lock().get(key).cloned();
        match completer {
            Some(completer) => {
                completer.set(value);
                None
            }
            None => Some(value),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Keeps a key registered in [`PendingReplies`] while alive.
#[derive(Debug)]
pub struct Registration<T> {
    key: String,
    completer: Arc<Completer<T>>,
    pending: PendingReplies<T>,
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        self.completer.close();
        let mut map = self.pending.inner.lock();
        if map
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.completer))
        {
            map.remove(&self.key);
        }
    }
}

/// Bounded FIFO of poll requests awaiting their response.
///
/// When full, the oldest entry is evicted to make room.
#[derive(Debug)]
pub struct CorrelationQueue<V> {
    inner: Mutex<QueueInner<V>>,
    capacity: usize,
}

#[derive(Debug)]
struct QueueInner<V> {
    order: VecDeque<String>,
    entries: HashMap<String, V>,
}

impl<V> CorrelationQueue<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Park `value` under `key`, returning the evicted oldest entry if the
    /// queue was full. Re-adding a key replaces its value.
    pub fn add(&self, key: &str, value: V) -> Option<(String, V)> {
        let mut inner = self.inner.lock();
        if inner.entries.insert(key.to_string(), value).is_some() {
            inner.order.retain(|k| k != key);
        }
        inner.order.push_back(key.to_string());

        if inner.order.len() > self.capacity {
            let oldest = inner.order.pop_front()?;
            let value = inner.entries.remove(&oldest)?;
            return Some((oldest, value));
        }
        None
    }

    /// Remove and return the entry for `key`.
    pub fn take(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let value = inner.entries.remove(key)?;
        inner.order.retain(|k| k != key);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<V> Default for CorrelationQueue<V> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_receives_value() {
        let (completer, handle) = wait_handle(Duration::from_secs(1));
        assert!(completer.set(7));
        assert!(!completer.set(8));
        assert_eq!(handle.wait().await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let (_completer, handle) = wait_handle::<u8>(Duration::from_millis(50));
        let err = handle.wait().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let (completer, handle) = wait_handle::<u8>(Duration::from_secs(5));
        completer.close();
        completer.close();
        assert!(matches!(handle.wait().await, Err(ConnectorError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_registration_does_not_leak() {
        let pending = PendingReplies::<u8>::new();
        {
            let (_registration, handle) = pending.register("0001", Duration::from_millis(10));
            assert!(pending.contains("0001"));
            assert!(handle.wait().await.unwrap_err().is_timeout());
        }
        assert!(pending.is_empty());
        assert_eq!(pending.complete("0001", 5), Some(5));
    }

    #[tokio::test]
    async fn test_complete_delivers_to_registered_key() {
        let pending = PendingReplies::<u8>::new();
        let (_registration, handle) = pending.register("00aa", Duration::from_secs(1));
        assert_eq!(pending.complete("00bb", 1), Some(1));
        assert_eq!(pending.complete("00aa", 2), None);
        assert_eq!(handle.wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reregistering_closes_previous() {
        let pending = PendingReplies::<u8>::new();
        let (first, first_handle) = pending.register("k", Duration::from_secs(1));
        let (_second, _) = pending.register("k", Duration::from_secs(1));
        assert!(matches!(first_handle.wait().await, Err(ConnectorError::Closed)));
        drop(first);
        assert!(pending.contains("k"));
    }

    #[test]
    fn test_queue_take_removes() {
        let queue = CorrelationQueue::new(4);
        assert!(queue.add("a", 1).is_none());
        assert_eq!(queue.take("a"), Some(1));
        assert_eq!(queue.take("a"), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_evicts_oldest() {
        let queue = CorrelationQueue::new(2);
        queue.add("a", 1);
        queue.add("b", 2);
        assert_eq!(queue.add("c", 3), Some(("a".to_string(), 1)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take("a"), None);
        assert_eq!(queue.take("b"), Some(2));
    }

    #[test]
    fn test_queue_readd_refreshes_position() {
        let queue = CorrelationQueue::new(2);
        queue.add("a", 1);
        queue.add("b", 2);
        queue.add("a", 10);
        assert_eq!(queue.add("c", 3), Some(("b".to_string(), 2)));
        assert_eq!(queue.take("a"), Some(10));
    }

    #[test]
    fn test_default_capacity() {
        let queue: CorrelationQueue<u8> = CorrelationQueue::default();
        assert_eq!(queue.capacity(), DEFAULT_QUEUE_CAPACITY);
    }
}
