//! Bus transport errors.

/// Errors reported by a [`crate::BusClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The client has not been connected yet
    #[error("not connected")]
    NotConnected,

    /// The connection has been closed
    #[error("connection closed")]
    Closed,

    /// No response arrived before the request deadline
    #[error("request timeout")]
    Timeout,

    /// Nobody is listening on the request subject
    #[error("no responders")]
    NoResponders,

    /// Subject exceeds the maximum control line size
    #[error("subject too long")]
    SubjectTooLong,

    /// Connecting to the server failed
    #[error("connect error: {0}")]
    Connect(String),

    /// Subscribing to a subject failed
    #[error("subscribe error: {0}")]
    Subscribe(String),

    /// Publishing a message failed
    #[error("publish error: {0}")]
    Publish(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(BusError::Timeout.to_string(), "request timeout");
        assert_eq!(
            BusError::Subscribe("bad subject".into()).to_string(),
            "subscribe error: bad subject"
        );
    }
}
