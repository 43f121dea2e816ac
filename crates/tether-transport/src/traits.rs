//! Transport abstraction traits for Tether.
//!
//! These traits define the interface that all transport implementations must provide,
//! allowing the registry to be transport-agnostic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Counter keeping connection ids unique within a process.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for an accepted transport.
///
/// This identifies the socket, not the agent: a reconnecting agent keeps its
/// client id but gets a fresh `ConnectionId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound message exceeded the configured limit.
    #[error("Message size {0} exceeds limit")]
    MessageTooLarge(usize),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A handle to one live connection.
///
/// Every method is non-blocking so that it can be called while the registry
/// lock is held. Writes are queued; a `send_text` that returns `Ok` has been
/// accepted for delivery, not necessarily flushed.
pub trait Transport: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;

    /// Queue a text message.
    fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Queue a transport-level ping.
    fn ping(&self) -> Result<(), TransportError>;

    /// Forcibly close the connection. Safe to call more than once.
    fn terminate(&self);
}

/// Something that happened on the inbound side of a connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// A text message (or UTF-8 binary message).
    Text(String),
    /// The peer answered a ping.
    Pong,
    /// The connection closed cleanly or was terminated locally.
    Closed,
    /// The connection failed.
    Error(TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
        assert_eq!(id.to_string(), "test-id");
    }
}
