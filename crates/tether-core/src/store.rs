//! In-memory presence store.
//!
//! A [`PersistenceGateway`] backed by a `DashMap`, with merge-or-insert
//! semantics matching a document store upsert.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::persister::{epoch_millis, InsertDefaults, PersistenceError, PersistenceGateway, PresencePatch};

/// A persisted presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub client_id: String,
    /// Display name, set when the record is created.
    pub name: String,
    /// Most recent name reported by the agent.
    pub reported_name: Option<String>,
    pub ip: Option<String>,
    pub online: bool,
    pub last_seen: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PresenceRecord {
    fn apply(&mut self, set: &PresencePatch) {
        if let Some(name) = &set.reported_name {
            self.reported_name = Some(name.clone());
        }
        if let Some(ip) = &set.ip {
            self.ip = Some(ip.clone());
        }
        self.online = set.online;
        self.last_seen = set.last_seen;
        self.updated_at = set.updated_at;
    }
}

/// Presence store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    records: DashMap<String, PresenceRecord>,
    upserts: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryGateway {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the record for a client.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<PresenceRecord> {
        self.records.get(client_id).map(|r| r.value().clone())
    }

    /// All records, ordered by client id.
    #[must_use]
    pub fn records(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        records
    }

    /// Delete a record. Presence tracking never does this on its own.
    pub fn remove(&self, client_id: &str) -> Option<PresenceRecord> {
        self.records.remove(client_id).map(|(_, r)| r)
    }

    /// Set the operator-assigned display name.
    ///
    /// Leaves `reportedName` alone. Returns `false` if there is no record.
    pub fn rename(&self, client_id: &str, name: &str) -> bool {
        match self.records.get_mut(client_id) {
            Some(mut record) => {
                record.name = name.to_string();
                record.updated_at = epoch_millis();
                true
            }
            None => false,
        }
    }

    /// Number of successful upserts.
    #[must_use]
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail, as an unreachable store would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn upsert(
        &self,
        client_id: &str,
        set: &PresencePatch,
        on_insert: &InsertDefaults,
    ) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store offline".into()));
        }

        self.records
            .entry(client_id.to_string())
            .and_modify(|record| record.apply(set))
            .or_insert_with(|| {
                let mut record = PresenceRecord {
                    client_id: client_id.to_string(),
                    name: on_insert.name.clone(),
                    reported_name: None,
                    ip: None,
                    online: false,
                    last_seen: 0,
                    created_at: on_insert.created_at,
                    updated_at: 0,
                };
                record.apply(set);
                record
            });

        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults(name: &str) -> InsertDefaults {
        InsertDefaults {
            created_at: 100,
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_merges() {
        let store = MemoryGateway::new();

        let mut online = PresencePatch::online("Bench1", "10.0.0.5");
        online.updated_at = 100;
        store.upsert("c1", &online, &defaults("Bench1")).await.unwrap();

        let mut offline = PresencePatch::offline();
        offline.updated_at = 200;
        store.upsert("c1", &offline, &defaults("Other")).await.unwrap();

        let record = store.get("c1").unwrap();
        assert_eq!(record.name, "Bench1");
        assert_eq!(record.ip.as_deref(), Some("10.0.0.5"));
        assert!(!record.online);
        assert_eq!(record.created_at, 100);
        assert_eq!(record.updated_at, 200);
        assert_eq!(store.upsert_count(), 2);
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryGateway::new();
        store.set_failing(true);

        let result = store
            .upsert("c1", &PresencePatch::seen(), &defaults("Client"))
            .await;
        assert!(matches!(result, Err(PersistenceError::Unavailable(_))));
        assert!(store.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_records_sorted_and_remove() {
        let store = MemoryGateway::new();
        for id in ["b", "a", "c"] {
            store
                .upsert(id, &PresencePatch::seen(), &defaults("Client"))
                .await
                .unwrap();
        }

        let ids: Vec<_> = store.records().into_iter().map(|r| r.client_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        assert!(store.remove("b").is_some());
        assert!(store.remove("b").is_none());
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn test_rename_keeps_reported_name() {
        let store = MemoryGateway::new();
        store
            .upsert("c1", &PresencePatch::online("Bench1", "10.0.0.5"), &defaults("Bench1"))
            .await
            .unwrap();

        assert!(store.rename("c1", "Front desk"));
        assert!(!store.rename("nobody", "Front desk"));

        // later agent writes do not touch the assigned name
        store
            .upsert("c1", &PresencePatch::online("Bench2", "10.0.0.5"), &defaults("Bench2"))
            .await
            .unwrap();
        let record = store.get("c1").unwrap();
        assert_eq!(record.name, "Front desk");
        assert_eq!(record.reported_name.as_deref(), Some("Bench2"));
    }
}
