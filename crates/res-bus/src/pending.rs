//! Pending Request Store - tracks requests awaiting a reply on the inbox.
//!
//! Maps request ids to their response callbacks and enforces per-request
//! deadlines.

use crate::client::ResponseCallback;
use crate::error::BusError;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A request waiting for its reply
struct PendingRequest {
    /// Callback to invoke with the outcome, taken exactly once
    callback: Mutex<Option<ResponseCallback>>,
    /// Start of the current deadline window
    started_at: Instant,
    /// Request subject (for logging)
    subject: String,
    /// Deadline measured from `started_at`
    timeout: Duration,
}

impl PendingRequest {
    fn resolve(self, result: Result<Bytes, BusError>) {
        if let Some(callback) = self.callback.into_inner() {
            callback(result);
        }
    }
}

/// Statistics for the pending request store
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total requests registered
    pub total_registered: AtomicU64,
    /// Total requests completed with a reply
    pub total_completed: AtomicU64,
    /// Total requests that timed out
    pub total_timeouts: AtomicU64,
    /// Total requests failed without a reply (publish error, close)
    pub total_failed: AtomicU64,
}

/// Pending request store.
///
/// Flow:
/// 1. `register()` assigns an id used as the reply inbox token
/// 2. The request is published with that inbox
/// 3. The listener calls `complete()` when the reply arrives
/// 4. A periodic `remove_expired()` fails requests past their deadline
pub struct PendingRequestStore {
    /// Map of request id to pending request
    pending: DashMap<u64, PendingRequest>,
    /// Next request id
    next_id: AtomicU64,
    /// Default timeout
    default_timeout: Duration,
    /// Statistics
    stats: Arc<PendingStats>,
}

impl PendingRequestStore {
    /// Create a new pending request store
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            default_timeout,
            stats: Arc::new(PendingStats::default()),
        }
    }

    /// Register a request and return its id.
    pub fn register(&self, subject: &str, callback: ResponseCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            id,
            PendingRequest {
                callback: Mutex::new(Some(callback)),
                started_at: Instant::now(),
                subject: subject.to_string(),
                timeout: self.default_timeout,
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        trace!(request_id = id, subject = subject, "Registered pending request");
        id
    }

    /// Complete a request with its reply.
    ///
    /// Returns false if the request is unknown or already expired.
    pub fn complete(&self, id: u64, result: Result<Bytes, BusError>) -> bool {
        match self.pending.remove(&id) {
            Some((_, request)) => {
                self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    request_id = id,
                    subject = %request.subject,
                    response_time_ms = request.started_at.elapsed().as_millis() as u64,
                    "Completed pending request"
                );
                request.resolve(result);
                true
            }
            None => {
                warn!(request_id = id, "Reply for unknown or expired request");
                false
            }
        }
    }

    /// Fail a single request without a reply.
    pub fn fail(&self, id: u64, err: BusError) -> bool {
        match self.pending.remove(&id) {
            Some((_, request)) => {
                self.stats.total_failed.fetch_add(1, Ordering::Relaxed);
                request.resolve(Err(err));
                true
            }
            None => false,
        }
    }

    /// Restart the deadline of a request with a new timeout.
    ///
    /// Used when a service announces that it needs more time.
    pub fn extend(&self, id: u64, timeout: Duration) -> bool {
        match self.pending.get_mut(&id) {
            Some(mut request) => {
                request.started_at = Instant::now();
                request.timeout = timeout;
                debug!(
                    request_id = id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Extended pending request timeout"
                );
                true
            }
            None => false,
        }
    }

    /// Fail every request past its deadline with [`BusError::Timeout`].
    ///
    /// Returns the number of requests removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| now.duration_since(entry.started_at) >= entry.timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, request)) = self.pending.remove(&id) {
                warn!(
                    request_id = id,
                    subject = %request.subject,
                    timeout_ms = request.timeout.as_millis() as u64,
                    "Request timed out"
                );
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                request.resolve(Err(BusError::Timeout));
                removed += 1;
            }
        }
        removed
    }

    /// Fail every pending request with `err`.
    pub fn fail_all(&self, err: BusError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.fail(*id, err.clone())).count()
    }

    /// Get number of currently pending requests
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if a request is pending
    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Get statistics
    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

/// Background task failing expired requests
pub async fn cleanup_task(store: Arc<PendingRequestStore>, interval: Duration) {
    let mut cleanup_interval = tokio::time::interval(interval);
    cleanup_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        cleanup_interval.tick().await;
        let removed = store.remove_expired();
        if removed > 0 {
            debug!(removed = removed, "Cleaned up expired pending requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    fn recording_callback() -> (ResponseCallback, Arc<Mutex<Option<Result<Bytes, BusError>>>>) {
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let cb: ResponseCallback = Box::new(move |result| {
            *s.lock() = Some(result);
        });
        (cb, slot)
    }

    #[test]
    fn test_register_and_complete() {
        let store = PendingRequestStore::new(Duration::from_secs(5));
        let (cb, slot) = recording_callback();

        let id = store.register("get.foo", cb);
        assert!(store.is_pending(id));
        assert_eq!(store.pending_count(), 1);

        assert!(store.complete(id, Ok(Bytes::from_static(b"{}"))));
        assert_eq!(slot.lock().take(), Some(Ok(Bytes::from_static(b"{}"))));
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_store_is_shareable() {
        assert_send_sync::<PendingRequestStore>();
        assert_send_sync::<Arc<PendingRequestStore>>();
    }

    #[tokio::test]
    async fn test_complete_from_another_task() {
        let store = Arc::new(PendingRequestStore::new(Duration::from_secs(5)));
        let (cb, slot) = recording_callback();
        let id = store.register("get.foo", cb);

        let remote = store.clone();
        let completed = tokio::spawn(async move { remote.complete(id, Ok(Bytes::from_static(b"ok"))) })
            .await
            .unwrap();
        assert!(completed);
        assert_eq!(slot.lock().take(), Some(Ok(Bytes::from_static(b"ok"))));
    }

    #[test]
    fn test_complete_unknown_id() {
        let store = PendingRequestStore::new(Duration::from_secs(5));
        assert!(!store.complete(42, Ok(Bytes::new())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_expired() {
        let store = PendingRequestStore::new(Duration::from_millis(100));
        let (cb1, slot1) = recording_callback();
        let (cb2, _slot2) = recording_callback();

        store.register("get.a", cb1);
        store.register("get.b", cb2);

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(store.remove_expired(), 0);

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(store.remove_expired(), 2);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(slot1.lock().take(), Some(Err(BusError::Timeout)));
        assert_eq!(store.stats().total_timeouts.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_restarts_deadline() {
        let store = PendingRequestStore::new(Duration::from_millis(100));
        let (cb, _slot) = recording_callback();
        let id = store.register("call.foo.slow", cb);

        tokio::time::advance(Duration::from_millis(90)).await;
        assert!(store.extend(id, Duration::from_millis(500)));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(store.remove_expired(), 0);
        assert!(store.is_pending(id));
    }

    #[test]
    fn test_fail_all() {
        let store = PendingRequestStore::new(Duration::from_secs(5));
        let (cb, slot) = recording_callback();
        store.register("get.a", cb);

        assert_eq!(store.fail_all(BusError::Closed), 1);
        assert_eq!(slot.lock().take(), Some(Err(BusError::Closed)));
        assert_eq!(store.stats().total_failed.load(Ordering::Relaxed), 1);
    }
}
