//! # Bus Client
//!
//! The interface the gateway uses to reach services.

use crate::error::BusError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// A message received on a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Full subject the message was published on.
    pub subject: String,
    /// Raw message payload.
    pub payload: Bytes,
}

impl BusMessage {
    /// Create a new message.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

/// Handler invoked for every message on a subscription.
pub type MessageHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Callback invoked once with the outcome of a request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Bytes, BusError>) + Send>;

/// Handler invoked when the connection closes without being asked to.
pub type ClosedHandler = Arc<dyn Fn(BusError) + Send + Sync>;

/// Handle returned by [`BusClient::subscribe`].
pub trait Unsubscriber: Send + Sync {
    /// Cancel the subscription.
    fn unsubscribe(&self) -> Result<(), BusError>;
}

/// Client to a subject based message bus.
///
/// Implementations must preserve call order: a subscription established
/// before a request is sent is active on the server before the request is
/// published. Handlers and callbacks are invoked from a single listener in
/// the order the messages were received.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Establish the connection.
    async fn connect(&self) -> Result<(), BusError>;

    /// Close the connection. Pending requests fail with [`BusError::Closed`].
    fn close(&self);

    /// Check whether the connection is closed.
    fn is_closed(&self) -> bool;

    /// Set the handler called when the connection is lost.
    fn set_closed_handler(&self, handler: ClosedHandler);

    /// Subscribe to all messages on `<namespace>.*`.
    fn subscribe(
        &self,
        namespace: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Unsubscriber>, BusError>;

    /// Send a request, invoking `callback` once with the response.
    fn send_request(&self, subject: &str, payload: Bytes, callback: ResponseCallback);
}
