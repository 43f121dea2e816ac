//! Targeted message delivery.
//!
//! The dispatcher is the boundary the admin layer talks to. It never
//! persists anything; callers record delivery outcomes themselves.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tether_protocol::{
    codec, OutboundFrame, DEFAULT_NOTIFY_DURATION_SECS, DEFAULT_NOTIFY_TITLE,
};
use tracing::debug;

use crate::registry::{ConnectionRegistry, ConnectionSnapshot};

/// Notification requested by a caller.
///
/// Every field is optional; see [`NotifyPayload::into_frame`] for defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NotifyPayload {
    pub title: Option<String>,
    pub text: Option<String>,
    /// Seconds. Numbers and numeric strings are accepted.
    pub duration: Option<Value>,
}

impl NotifyPayload {
    /// Payload carrying only text.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Build the outbound frame, filling in defaults for empty fields.
    #[must_use]
    pub fn into_frame(self) -> OutboundFrame {
        let duration = coerce_duration(self.duration.as_ref());
        let title = self
            .title
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_NOTIFY_TITLE.to_string());

        OutboundFrame::notify(title, self.text.unwrap_or_default(), duration)
    }
}

/// Read a duration in seconds. Missing, zero and non-numeric values fall
/// back to the default.
fn coerce_duration(value: Option<&Value>) -> i64 {
    let seconds = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().and_then(whole_seconds)),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().and_then(whole_seconds),
        _ => None,
    };

    seconds
        .filter(|s| *s != 0)
        .unwrap_or(DEFAULT_NOTIFY_DURATION_SECS)
}

fn whole_seconds(value: f64) -> Option<i64> {
    value.is_finite().then(|| value.trunc() as i64)
}

/// Sends notifications to connected agents.
#[derive(Clone)]
pub struct MessageDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl MessageDispatcher {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver a notification to `client_id`.
    ///
    /// Returns `false` if the client is not connected or the write fails.
    pub fn send(&self, client_id: &str, payload: NotifyPayload) -> bool {
        let client_id = client_id.trim();
        let Some(transport) = self.registry.transport(client_id) else {
            debug!(client = %client_id, "Notify target not connected");
            return false;
        };
        if !transport.is_open() {
            debug!(client = %client_id, "Notify target transport closed");
            return false;
        }

        let text = match codec::encode(&payload.into_frame()) {
            Ok(text) => text,
            Err(e) => {
                debug!(client = %client_id, error = %e, "Failed to encode notify");
                return false;
            }
        };

        match transport.send_text(text) {
            Ok(()) => {
                debug!(client = %client_id, "Notify sent");
                true
            }
            Err(e) => {
                debug!(client = %client_id, error = %e, "Notify write failed");
                false
            }
        }
    }

    /// List the currently connected clients.
    #[must_use]
    pub fn list_connections(&self) -> ConnectionSnapshot {
        self.registry.snapshot()
    }
}
