//! Frame types for the Tether protocol.
//!
//! Frames are JSON objects tagged by a `type` field. Inbound frames come
//! from agents; outbound frames are produced by the server.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Title used for notifications that do not carry one.
pub const DEFAULT_NOTIFY_TITLE: &str = "Thông báo";

/// Display duration (seconds) for notifications that do not carry one.
pub const DEFAULT_NOTIFY_DURATION_SECS: i64 = 30;

/// Display name recorded for agents that do not report one.
pub const DEFAULT_CLIENT_NAME: &str = "Client";

/// A frame sent by an agent.
///
/// Any `type` this version does not understand decodes to
/// [`InboundFrame::Unknown`] so that newer agents keep working.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    /// Announce the agent and bind its client id to the connection.
    #[serde(rename = "hello")]
    Hello {
        /// Caller-supplied identity. Not yet trimmed.
        #[serde(rename = "clientId", default, deserialize_with = "lenient_string")]
        client_id: Option<String>,
        /// Display name reported by the agent.
        #[serde(default, deserialize_with = "lenient_string")]
        name: Option<String>,
        /// Address reported by the agent.
        #[serde(default, deserialize_with = "lenient_string")]
        ip: Option<String>,
    },

    /// Application-level keepalive.
    #[serde(rename = "heartbeat")]
    Heartbeat {},

    /// Diagnostic text.
    #[serde(rename = "log")]
    Log {
        #[serde(default, deserialize_with = "lenient_string")]
        text: Option<String>,
    },

    /// Any other frame type.
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    /// Short name of the frame type, for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Hello { .. } => "hello",
            InboundFrame::Heartbeat {} => "heartbeat",
            InboundFrame::Log { .. } => "log",
            InboundFrame::Unknown => "unknown",
        }
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    /// Notification to display on the agent.
    #[serde(rename = "notify")]
    Notify {
        title: String,
        text: String,
        /// Display duration in seconds.
        duration: i64,
    },
}

impl OutboundFrame {
    /// Create a new Notify frame.
    #[must_use]
    pub fn notify(title: impl Into<String>, text: impl Into<String>, duration: i64) -> Self {
        OutboundFrame::Notify {
            title: title.into(),
            text: text.into(),
            duration,
        }
    }
}

/// Accept strings, numbers and booleans as text; `null` and structured
/// values read as absent.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_fields() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"hello","clientId":" c1 ","name":"Bench1","ip":"10.0.0.5"}"#)
                .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Hello {
                client_id: Some(" c1 ".to_string()),
                name: Some("Bench1".to_string()),
                ip: Some("10.0.0.5".to_string()),
            }
        );
        assert_eq!(frame.kind(), "hello");
    }

    #[test]
    fn test_hello_lenient_scalars() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"hello","clientId":42,"name":null}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Hello {
                client_id: Some("42".to_string()),
                name: None,
                ip: None,
            }
        );
    }

    #[test]
    fn test_heartbeat_ignores_extra_fields() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"heartbeat","ts":1700000000}"#).unwrap();
        assert_eq!(frame, InboundFrame::Heartbeat {});
    }

    #[test]
    fn test_unknown_type() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"screenshot","data":"..."}"#).unwrap();
        assert_eq!(frame, InboundFrame::Unknown);
        assert_eq!(frame.kind(), "unknown");
    }

    #[test]
    fn test_notify_shape() {
        let value = serde_json::to_value(OutboundFrame::notify("Maintenance", "Reboot at 5", 45)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "notify",
                "title": "Maintenance",
                "text": "Reboot at 5",
                "duration": 45
            })
        );
    }
}
