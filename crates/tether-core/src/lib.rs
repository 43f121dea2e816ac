//! # tether-core
//!
//! Presence tracking and targeted delivery for the Tether engine.
//!
//! - **Registry** - Authoritative map of live connections by client id
//! - **Handler** - Per-connection protocol state machine
//! - **Heartbeat** - Periodic ping and eviction of silent connections
//! - **Persister** - Throttled, best-effort mirroring into a presence store
//! - **Dispatcher** - `send(client_id, payload)` for the admin layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Handler   │────▶│  Registry   │────▶│  Persister  │──▶ store
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!                                           ▲         ▲
//!                                ┌──────────┘         └──────────┐
//!                          ┌─────────────┐               ┌─────────────┐
//!                          │  Heartbeat  │               │ Dispatcher  │
//!                          └─────────────┘               └─────────────┘
//! ```

pub mod dispatcher;
pub mod handler;
pub mod heartbeat;
pub mod persister;
pub mod registry;
pub mod store;

pub use dispatcher::{MessageDispatcher, NotifyPayload};
pub use handler::{ConnectionState, FrameOutcome, ProtocolHandler};
pub use heartbeat::{HeartbeatConfig, HeartbeatHandle, HeartbeatMonitor, TickReport};
pub use persister::{
    InsertDefaults, PersistenceError, PersistenceGateway, PersisterConfig, PresencePatch,
    PresencePersister,
};
pub use registry::{ClientMeta, ConnectionInfo, ConnectionRegistry, ConnectionSnapshot};
pub use store::{MemoryGateway, PresenceRecord};
