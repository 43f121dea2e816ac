//! # tether-protocol
//!
//! Wire protocol definitions for the Tether presence engine.
//!
//! Agents and the server exchange JSON text frames discriminated by a
//! `type` field. Liveness itself rides on transport-level ping/pong and is
//! not part of this crate.
//!
//! ## Frame Types
//!
//! - `hello` - Bind a client id to the connection
//! - `heartbeat` - Application-level liveness signal
//! - `log` - Diagnostic text from the agent
//! - `notify` - Operator notification delivered to an agent
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, InboundFrame, OutboundFrame};
//!
//! let frame = codec::decode(r#"{"type":"hello","clientId":"c1","name":"Bench1"}"#).unwrap();
//! assert!(matches!(frame, InboundFrame::Hello { .. }));
//!
//! let text = codec::encode(&OutboundFrame::notify("Title", "hi", 30)).unwrap();
//! assert!(text.contains(r#""type":"notify""#));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{
    InboundFrame, OutboundFrame, DEFAULT_CLIENT_NAME, DEFAULT_NOTIFY_DURATION_SECS,
    DEFAULT_NOTIFY_TITLE,
};
