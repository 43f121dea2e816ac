//! Best-effort presence persistence.
//!
//! The registry is the source of truth for who is online; the persister
//! mirrors it into a [`PersistenceGateway`] without ever blocking the caller.
//! Writes are queued to a single writer task, which keeps them in order and
//! bounds each one with a timeout. Failures are logged and dropped.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether_protocol::DEFAULT_CLIENT_NAME;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the write.
    #[error("Store error: {0}")]
    Store(String),
}

/// Fields applied on every write for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePatch {
    /// Name reported by the agent. `None` leaves the stored value alone.
    pub reported_name: Option<String>,
    /// Address reported by the agent. `None` leaves the stored value alone.
    pub ip: Option<String>,
    pub online: bool,
    /// Epoch milliseconds.
    pub last_seen: u64,
    /// Epoch milliseconds, stamped by the persister when the write is queued.
    pub updated_at: u64,
}

impl PresencePatch {
    /// Full online write, issued on `hello`.
    #[must_use]
    pub fn online(reported_name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            reported_name: Some(reported_name.into()),
            ip: Some(ip.into()),
            online: true,
            last_seen: epoch_millis(),
            updated_at: 0,
        }
    }

    /// Offline write, issued when a connection is removed.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            reported_name: None,
            ip: None,
            online: false,
            last_seen: epoch_millis(),
            updated_at: 0,
        }
    }

    /// Liveness refresh: online flag and last seen only.
    #[must_use]
    pub fn seen() -> Self {
        Self {
            online: true,
            ..Self::offline()
        }
    }
}

/// Fields applied only when the write creates the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertDefaults {
    /// Epoch milliseconds.
    pub created_at: u64,
    pub name: String,
}

impl InsertDefaults {
    fn for_patch(patch: &PresencePatch) -> Self {
        let name = patch
            .reported_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_CLIENT_NAME);

        Self {
            created_at: patch.updated_at,
            name: name.to_string(),
        }
    }
}

/// Upsert-by-key store for presence records.
#[async_trait]
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Merge `set` into the record for `client_id`, creating it with
    /// `on_insert` applied if it does not exist yet.
    async fn upsert(
        &self,
        client_id: &str,
        set: &PresencePatch,
        on_insert: &InsertDefaults,
    ) -> Result<(), PersistenceError>;
}

/// Persister configuration.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Minimum spacing of liveness writes per client.
    pub throttle: Duration,
    /// Upper bound on a single store write.
    pub write_timeout: Duration,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(30_000),
            write_timeout: Duration::from_millis(5_000),
        }
    }
}

enum Command {
    Write {
        client_id: String,
        patch: PresencePatch,
    },
    Flush(oneshot::Sender<()>),
    Close,
}

/// Handle for queueing presence writes.
///
/// Cheap to clone. The writer task exits once every handle is dropped and
/// the queue is drained, or when [`PresencePersister::close`] is called.
#[derive(Clone)]
pub struct PresencePersister {
    tx: mpsc::UnboundedSender<Command>,
    throttle: Duration,
}

impl PresencePersister {
    /// Start the writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        gateway: Arc<dyn PersistenceGateway>,
        config: PersisterConfig,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(gateway, rx, config.write_timeout));

        (
            Self {
                tx,
                throttle: config.throttle,
            },
            task,
        )
    }

    /// Configured throttle window.
    #[must_use]
    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    /// Queue a write that is never suppressed.
    pub fn upsert_unconditional(&self, client_id: &str, mut patch: PresencePatch) {
        patch.updated_at = epoch_millis();
        trace!(client = %client_id, online = patch.online, "Queueing presence write");

        let command = Command::Write {
            client_id: client_id.to_string(),
            patch,
        };
        if self.tx.send(command).is_err() {
            warn!(client = %client_id, "Presence writer stopped, dropping write");
        }
    }

    /// Queue a write unless one was issued for this client within the
    /// throttle window.
    ///
    /// `last_persisted` belongs to the client's registry entry and is updated
    /// when the write goes through. Returns `true` if a write was queued.
    pub fn throttled_upsert(
        &self,
        client_id: &str,
        last_persisted: &mut Option<Instant>,
        patch: PresencePatch,
    ) -> bool {
        let now = Instant::now();
        if let Some(prev) = *last_persisted {
            if now.duration_since(prev) < self.throttle {
                return false;
            }
        }

        *last_persisted = Some(now);
        self.upsert_unconditional(client_id, patch);
        true
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop the writer once every write queued before this call has been
    /// attempted.
    ///
    /// Writes queued afterwards are dropped. Await the writer's
    /// `JoinHandle` to wait for the drain.
    pub fn close(&self) {
        if self.tx.send(Command::Close).is_err() {
            debug!("Presence writer already stopped");
        }
    }
}

async fn run_writer(
    gateway: Arc<dyn PersistenceGateway>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    write_timeout: Duration,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Write { client_id, patch } => {
                let on_insert = InsertDefaults::for_patch(&patch);
                let write = gateway.upsert(&client_id, &patch, &on_insert);

                match tokio::time::timeout(write_timeout, write).await {
                    Ok(Ok(())) => {
                        trace!(client = %client_id, online = patch.online, "Presence persisted");
                    }
                    Ok(Err(e)) => {
                        warn!(client = %client_id, error = %e, "Presence write failed");
                    }
                    Err(_) => {
                        warn!(
                            client = %client_id,
                            timeout_ms = write_timeout.as_millis() as u64,
                            "Presence write timed out"
                        );
                    }
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Close => break,
        }
    }

    debug!("Presence writer stopped");
}
