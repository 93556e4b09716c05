//! # In-Memory Bus
//!
//! A [`BusClient`] kept entirely in process. Requests are parked until the
//! test answers them, and published messages are routed to matching
//! subscriptions synchronously.

use crate::client::{BusClient, BusMessage, ClosedHandler, MessageHandler, ResponseCallback, Unsubscriber};
use crate::error::BusError;
use crate::subject;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// How long [`MemoryBus::next_request`] waits before giving up.
const REQUEST_WAIT: Duration = Duration::from_secs(5);

struct MemorySubscription {
    id: u64,
    pattern: String,
    handler: MessageHandler,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    subscriptions: Vec<MemorySubscription>,
    requests: VecDeque<MemoryRequest>,
    subscribe_log: Vec<String>,
}

/// A request parked on the in-memory bus, waiting for a reply.
pub struct MemoryRequest {
    /// Request subject.
    pub subject: String,
    /// Request payload.
    pub payload: Bytes,
    callback: ResponseCallback,
}

impl MemoryRequest {
    /// Payload as UTF-8 text.
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or_default()
    }

    /// Answer the request with a payload.
    pub fn respond(self, payload: impl Into<Bytes>) {
        (self.callback)(Ok(payload.into()));
    }

    /// Fail the request with a transport error.
    pub fn fail(self, err: BusError) {
        (self.callback)(Err(err));
    }
}

impl std::fmt::Debug for MemoryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRequest")
            .field("subject", &self.subject)
            .field("payload", &self.payload_str())
            .finish()
    }
}

/// In-process bus for tests.
pub struct MemoryBus {
    state: Arc<Mutex<MemoryState>>,
    request_added: Arc<Notify>,
    closed: AtomicBool,
    closed_handler: Mutex<Option<ClosedHandler>>,
}

impl MemoryBus {
    /// Create a new, connected in-memory bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            request_added: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            closed_handler: Mutex::new(None),
        }
    }

    /// Publish a message to every matching subscription.
    ///
    /// Returns the number of subscriptions that received it.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let handlers: Vec<MessageHandler> = {
            let state = self.state.lock();
            state
                .subscriptions
                .iter()
                .filter(|s| subject::matches(&s.pattern, subject))
                .map(|s| s.handler.clone())
                .collect()
        };

        trace!(subject = subject, receivers = handlers.len(), "Memory bus publish");
        for handler in &handlers {
            handler(BusMessage::new(subject, payload.clone()));
        }
        handlers.len()
    }

    /// Take the oldest parked request sent on `subject`.
    pub fn take_request(&self, subject: &str) -> Option<MemoryRequest> {
        let mut state = self.state.lock();
        let pos = state.requests.iter().position(|r| r.subject == subject)?;
        state.requests.remove(pos)
    }

    /// Wait for a request on `subject` to be sent, then take it.
    pub async fn next_request(&self, subject: &str) -> Option<MemoryRequest> {
        let deadline = tokio::time::Instant::now() + REQUEST_WAIT;
        loop {
            let notified = self.request_added.notified();
            if let Some(request) = self.take_request(subject) {
                return Some(request);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take_request(subject);
            }
        }
    }

    /// Answer the oldest parked request on `subject`.
    pub fn respond(&self, subject: &str, payload: impl Into<Bytes>) -> bool {
        match self.take_request(subject) {
            Some(request) => {
                request.respond(payload);
                true
            }
            None => false,
        }
    }

    /// Subjects of all parked requests, oldest first.
    pub fn pending_requests(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|r| r.subject.clone())
            .collect()
    }

    /// Number of live subscriptions on exactly `pattern`.
    pub fn subscription_count(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.pattern == pattern)
            .count()
    }

    /// Check whether a live subscription on exactly `pattern` exists.
    pub fn has_subscription(&self, pattern: &str) -> bool {
        self.subscription_count(pattern) > 0
    }

    /// Every pattern ever subscribed, in call order.
    pub fn subscribe_history(&self) -> Vec<String> {
        self.state.lock().subscribe_log.clone()
    }

    /// Simulate the server dropping the connection.
    pub fn simulate_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handler = self.closed_handler.lock().clone();
        if let Some(handler) = handler {
            handler(BusError::Closed);
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryUnsubscriber {
    state: Arc<Mutex<MemoryState>>,
    id: u64,
}

impl Unsubscriber for MemoryUnsubscriber {
    fn unsubscribe(&self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != self.id);
        if state.subscriptions.len() == before {
            return Err(BusError::Subscribe("subscription not found".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BusClient for MemoryBus {
    async fn connect(&self) -> Result<(), BusError> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let requests: Vec<MemoryRequest> = self.state.lock().requests.drain(..).collect();
        for request in requests {
            request.fail(BusError::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_closed_handler(&self, handler: ClosedHandler) {
        *self.closed_handler.lock() = Some(handler);
    }

    fn subscribe(
        &self,
        namespace: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Unsubscriber>, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let pattern = format!("{}.*", namespace);
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        debug!(subject = %pattern, "Memory bus subscribe");
        state.subscribe_log.push(pattern.clone());
        state.subscriptions.push(MemorySubscription {
            id,
            pattern,
            handler,
        });
        Ok(Box::new(MemoryUnsubscriber {
            state: self.state.clone(),
            id,
        }))
    }

    fn send_request(&self, subject: &str, payload: Bytes, callback: ResponseCallback) {
        if self.is_closed() {
            tokio::spawn(async move { callback(Err(BusError::Closed)) });
            return;
        }
        trace!(subject = subject, "Memory bus request");
        self.state.lock().requests.push_back(MemoryRequest {
            subject: subject.to_string(),
            payload,
            callback,
        });
        self.request_added.notify_waiters();
    }
}
