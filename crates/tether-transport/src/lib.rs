//! # tether-transport
//!
//! Transport abstraction layer for the Tether presence engine.
//!
//! The registry never touches sockets directly. It holds a [`Transport`]
//! handle per connection and calls non-blocking operations on it:
//!
//! - **WebSocket** - axum WebSocket with a dedicated writer task
//! - **Memory** - in-process transport used by tests and benchmarks
//!
//! ```rust,ignore
//! use tether_transport::{TransportEvent, WebSocketConnection};
//!
//! async fn handle(mut conn: WebSocketConnection) {
//!     loop {
//!         match conn.next_event().await {
//!             TransportEvent::Text(text) => { /* decode frame */ }
//!             TransportEvent::Pong => { /* liveness */ }
//!             TransportEvent::Closed | TransportEvent::Error(_) => break,
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::MemoryTransport;
pub use traits::{ConnectionId, Transport, TransportError, TransportEvent};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketHandle};
