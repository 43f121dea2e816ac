//! The connection registry.
//!
//! The registry is the single authority on which clients are reachable right
//! now. Every mutation happens under one lock over the whole map; the
//! expected number of agents is small, and a single lock makes
//! "last hello wins" and "offline exactly once" easy to reason about.
//! Nothing done under the lock waits: transport operations are queued and
//! persistence writes are handed to the [`PresencePersister`].

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tether_transport::{ConnectionId, Transport};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::persister::{epoch_millis, PresencePatch, PresencePersister};

/// Metadata reported by an agent in its `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMeta {
    pub display_name: String,
    pub source_address: String,
}

/// A live connection, keyed by client id.
pub struct ConnectionEntry {
    client_id: String,
    transport: Arc<dyn Transport>,
    display_name: String,
    source_address: String,
    /// Last liveness signal, monotonic.
    pub(crate) last_seen: Instant,
    /// Last liveness signal, wall clock (epoch ms).
    pub(crate) last_seen_at: u64,
    pub(crate) missed_pongs: u32,
    /// Set by any liveness signal, cleared when a ping goes out.
    pub(crate) responsive: bool,
    pub(crate) last_persisted: Option<Instant>,
    pub(crate) closing: bool,
}

impl ConnectionEntry {
    fn new(client_id: &str, transport: Arc<dyn Transport>, meta: ClientMeta) -> Self {
        let now = Instant::now();
        Self {
            client_id: client_id.to_string(),
            transport,
            display_name: meta.display_name,
            source_address: meta.source_address,
            last_seen: now,
            last_seen_at: epoch_millis(),
            missed_pongs: 0,
            responsive: true,
            // The online write issued on registration counts for throttling.
            last_persisted: Some(now),
            closing: false,
        }
    }

    fn mark_alive(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_at = epoch_millis();
        self.missed_pongs = 0;
        self.responsive = true;
    }

    /// Get the client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the live transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Consecutive heartbeat ticks without a liveness signal.
    #[must_use]
    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs
    }

    /// Time of the last liveness signal.
    #[must_use]
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            client_id: self.client_id.clone(),
            display_name: self.display_name.clone(),
            source_address: self.source_address.clone(),
            online: true,
            last_seen: self.last_seen_at,
        }
    }
}

/// Read-only view of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub client_id: String,
    pub display_name: String,
    pub source_address: String,
    /// Always `true`: only online clients live in the registry.
    pub online: bool,
    /// Epoch milliseconds.
    pub last_seen: u64,
}

/// Point-in-time copy of the registry for listing.
///
/// It can be iterated any number of times. It goes stale as soon as it is
/// taken, so do not use it for liveness decisions.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ConnectionSnapshot {
    entries: Vec<ConnectionInfo>,
}

impl ConnectionSnapshot {
    /// Iterate over the captured entries.
    pub fn iter(&self) -> std::slice::Iter<'_, ConnectionInfo> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for ConnectionSnapshot {
    type Item = ConnectionInfo;
    type IntoIter = std::vec::IntoIter<ConnectionInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ConnectionSnapshot {
    type Item = &'a ConnectionInfo;
    type IntoIter = std::slice::Iter<'a, ConnectionInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

pub(crate) type EntryMap = HashMap<String, ConnectionEntry>;

/// Authoritative map of live connections.
pub struct ConnectionRegistry {
    entries: Mutex<EntryMap>,
    persister: PresencePersister,
}

impl ConnectionRegistry {
    /// Create an empty registry writing through `persister`.
    #[must_use]
    pub fn new(persister: PresencePersister) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            persister,
        }
    }

    /// Get the persister used by this registry.
    #[must_use]
    pub fn persister(&self) -> &PresencePersister {
        &self.persister
    }

    /// Register a connection for `client_id`, replacing any existing one.
    ///
    /// A different transport already registered under the same id is
    /// terminated first. Always queues an online write.
    pub fn register_or_replace(&self, client_id: &str, transport: Arc<dyn Transport>, meta: ClientMeta) {
        let mut entries = self.entries.lock();

        if let Some(previous) = entries.get_mut(client_id) {
            if previous.transport.id() != transport.id() {
                info!(
                    client = %client_id,
                    previous = %previous.transport.id(),
                    connection = %transport.id(),
                    "Replacing connection"
                );
                previous.closing = true;
                previous.transport.terminate();
            }
        }

        let patch = PresencePatch::online(meta.display_name.clone(), meta.source_address.clone());
        debug!(
            client = %client_id,
            connection = %transport.id(),
            name = %meta.display_name,
            "Registered"
        );
        entries.insert(
            client_id.to_string(),
            ConnectionEntry::new(client_id, transport, meta),
        );

        self.persister.upsert_unconditional(client_id, patch);
    }

    /// Record a liveness signal. Returns `false` if the client is unknown.
    pub fn touch(&self, client_id: &str) -> bool {
        match self.entries.lock().get_mut(client_id) {
            Some(entry) => {
                entry.mark_alive();
                true
            }
            None => false,
        }
    }

    /// Record a liveness signal arriving on `connection` and persist it,
    /// throttled.
    ///
    /// Signals from a connection that no longer holds `client_id` are
    /// ignored. Returns `true` if the signal was counted.
    pub fn touch_connection(&self, client_id: &str, connection: &ConnectionId) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(client_id) else {
            return false;
        };
        if entry.transport.id() != connection || entry.closing {
            trace!(client = %client_id, connection = %connection, "Ignoring stale liveness signal");
            return false;
        }

        entry.mark_alive();
        self.persister.throttled_upsert(
            client_id,
            &mut entry.last_persisted,
            PresencePatch::seen(),
        );
        true
    }

    /// Persist a liveness refresh, at most once per throttle window.
    ///
    /// Returns `true` if a write was queued.
    pub fn persist_seen(&self, client_id: &str) -> bool {
        match self.entries.lock().get_mut(client_id) {
            Some(entry) => self.persister.throttled_upsert(
                client_id,
                &mut entry.last_persisted,
                PresencePatch::seen(),
            ),
            None => false,
        }
    }

    /// Remove the entry for `client_id`, whatever transport it holds.
    ///
    /// Returns `true` if this call performed the removal and queued the
    /// offline write.
    pub fn remove_if_present(&self, client_id: &str) -> bool {
        let mut entries = self.entries.lock();
        self.remove_locked(&mut entries, client_id)
    }

    /// Remove the entry for `client_id` only if it is still held by
    /// `connection`.
    ///
    /// Close and error events from a displaced transport go through here so
    /// they cannot take down the connection that replaced it.
    pub fn remove_connection(&self, client_id: &str, connection: &ConnectionId) -> bool {
        let mut entries = self.entries.lock();
        let owned = entries
            .get(client_id)
            .map(|entry| entry.transport.id() == connection);

        match owned {
            Some(true) => self.remove_locked(&mut entries, client_id),
            Some(false) => {
                debug!(client = %client_id, connection = %connection, "Stale connection closed");
                false
            }
            None => false,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryMap> {
        self.entries.lock()
    }

    pub(crate) fn remove_locked(&self, entries: &mut EntryMap, client_id: &str) -> bool {
        let Some(entry) = entries.get_mut(client_id) else {
            return false;
        };
        if entry.closing {
            return false;
        }
        entry.closing = true;

        if let Some(entry) = entries.remove(client_id) {
            info!(client = %client_id, connection = %entry.transport.id(), "Client offline");
        }
        self.persister
            .upsert_unconditional(client_id, PresencePatch::offline());
        true
    }

    /// Copy the current entries for listing.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let mut entries: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter(|e| !e.closing)
            .map(ConnectionEntry::info)
            .collect();
        entries.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        ConnectionSnapshot { entries }
    }

    /// Get the transport registered for `client_id`.
    #[must_use]
    pub fn transport(&self, client_id: &str) -> Option<Arc<dyn Transport>> {
        self.entries
            .lock()
            .get(client_id)
            .map(|e| Arc::clone(&e.transport))
    }

    /// Get the missed pong count for `client_id`.
    #[must_use]
    pub fn missed_pongs(&self, client_id: &str) -> Option<u32> {
        self.entries.lock().get(client_id).map(|e| e.missed_pongs)
    }

    /// Check if `client_id` is registered.
    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.entries.lock().contains_key(client_id)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
