//! Per-connection protocol handling.
//!
//! One [`ProtocolHandler`] lives alongside each accepted transport and turns
//! its inbound events into registry operations:
//!
//! ```text
//! CONNECTING ──hello──▶ REGISTERED ──close / error──▶ CLOSING ──▶ REMOVED
//!      │                 ▲      │
//!      │                 └──────┘ heartbeat / pong
//!      └───────────── close / error ─────────────────────────────▶ REMOVED
//! ```
//!
//! Heartbeat eviction removes the registry entry from the outside; the
//! transport is terminated at the same time, so the handler then sees a close.

use std::sync::Arc;
use tether_protocol::{codec, InboundFrame, DEFAULT_CLIENT_NAME};
use tether_transport::{Transport, TransportError};
use tracing::{debug, info, trace};

use crate::registry::{ClientMeta, ConnectionRegistry};

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, no client id bound yet.
    Connecting,
    /// Bound to a client id and registered.
    Registered,
    /// Termination in progress.
    Closing,
    /// Terminated. No further events are processed.
    Removed,
}

/// What a handled frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A `hello` registered the contained client id.
    Registered(String),
    /// A `heartbeat` refreshed liveness.
    Heartbeat,
    /// A `log` frame was written to the log.
    Logged,
    /// The frame was valid but had no effect.
    Ignored,
    /// The frame could not be decoded.
    Malformed,
}

impl FrameOutcome {
    /// Short label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            FrameOutcome::Registered(_) => "hello",
            FrameOutcome::Heartbeat => "heartbeat",
            FrameOutcome::Logged => "log",
            FrameOutcome::Ignored => "ignored",
            FrameOutcome::Malformed => "malformed",
        }
    }
}

/// Protocol state machine for a single connection.
pub struct ProtocolHandler {
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    client_id: Option<String>,
    state: ConnectionState,
}

impl ProtocolHandler {
    /// Create a handler for a freshly accepted transport.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            client_id: None,
            state: ConnectionState::Connecting,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Client id bound by `hello`, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Handle an inbound text message.
    ///
    /// Undecodable text is dropped without a reply.
    pub fn handle_text(&mut self, text: &str) -> FrameOutcome {
        if self.is_terminated() {
            return FrameOutcome::Ignored;
        }

        match codec::decode(text) {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => {
                debug!(connection = %self.transport.id(), error = %e, "Discarding frame");
                FrameOutcome::Malformed
            }
        }
    }

    /// Handle a decoded frame.
    pub fn handle_frame(&mut self, frame: InboundFrame) -> FrameOutcome {
        if self.is_terminated() {
            return FrameOutcome::Ignored;
        }

        match frame {
            InboundFrame::Hello {
                client_id,
                name,
                ip,
            } => self.on_hello(client_id, name, ip),

            InboundFrame::Heartbeat {} => {
                if self.record_liveness() {
                    FrameOutcome::Heartbeat
                } else {
                    FrameOutcome::Ignored
                }
            }

            InboundFrame::Log { text } => match &self.client_id {
                Some(client_id) => {
                    info!(client = %client_id, text = %text.unwrap_or_default(), "Agent log");
                    FrameOutcome::Logged
                }
                None => FrameOutcome::Ignored,
            },

            InboundFrame::Unknown => {
                trace!(connection = %self.transport.id(), "Ignoring unknown frame type");
                FrameOutcome::Ignored
            }
        }
    }

    /// Handle a transport-level pong.
    ///
    /// Returns `true` if it counted as a liveness signal.
    pub fn handle_pong(&mut self) -> bool {
        self.record_liveness()
    }

    /// Handle the transport closing.
    ///
    /// Returns `true` if this call took the client offline.
    pub fn handle_close(&mut self) -> bool {
        self.shutdown("closed")
    }

    /// Handle a transport failure.
    ///
    /// Returns `true` if this call took the client offline.
    pub fn handle_error(&mut self, error: &TransportError) -> bool {
        debug!(connection = %self.transport.id(), error = %error, "Transport error");
        self.shutdown("error")
    }

    fn on_hello(
        &mut self,
        client_id: Option<String>,
        name: Option<String>,
        ip: Option<String>,
    ) -> FrameOutcome {
        let client_id = client_id.unwrap_or_default().trim().to_string();
        if client_id.is_empty() {
            debug!(connection = %self.transport.id(), "Discarding hello without client id");
            return FrameOutcome::Ignored;
        }

        if let Some(previous) = self.client_id.take() {
            if previous != client_id {
                debug!(from = %previous, to = %client_id, "Connection rebinding client id");
                self.registry
                    .remove_connection(&previous, self.transport.id());
            }
        }

        let display_name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string());
        let source_address = ip
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.transport.remote_addr())
            .unwrap_or_default();

        info!(
            client = %client_id,
            name = %display_name,
            ip = %source_address,
            "Hello"
        );

        self.registry.register_or_replace(
            &client_id,
            Arc::clone(&self.transport),
            ClientMeta {
                display_name,
                source_address,
            },
        );
        self.client_id = Some(client_id.clone());
        self.state = ConnectionState::Registered;

        FrameOutcome::Registered(client_id)
    }

    fn record_liveness(&self) -> bool {
        if self.state != ConnectionState::Registered {
            return false;
        }
        let Some(client_id) = self.client_id.as_deref() else {
            return false;
        };

        self.registry
            .touch_connection(client_id, self.transport.id())
    }

    fn shutdown(&mut self, reason: &'static str) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.state = ConnectionState::Closing;

        let removed = match &self.client_id {
            Some(client_id) => self
                .registry
                .remove_connection(client_id, self.transport.id()),
            None => false,
        };

        debug!(
            connection = %self.transport.id(),
            client = ?self.client_id,
            reason,
            removed,
            "Connection finished"
        );
        self.state = ConnectionState::Removed;
        removed
    }

    fn is_terminated(&self) -> bool {
        matches!(self.state, ConnectionState::Closing | ConnectionState::Removed)
    }
}
