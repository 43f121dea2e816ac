//! Heartbeat monitor.
//!
//! Every tick each registered connection is either pinged, charged a missed
//! pong, or evicted. A connection that answers (pong or `heartbeat` frame)
//! between two ticks is never charged.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::registry::ConnectionRegistry;

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between ticks.
    pub ping_interval: Duration,
    /// Missed ticks after which a connection is terminated.
    pub max_missed_pongs: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(15_000),
            max_missed_pongs: 2,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections a ping was sent (or attempted) to.
    pub pinged: usize,
    /// Connections charged a missed pong on this tick.
    pub missed: usize,
    /// Client ids removed on this tick.
    pub evicted: Vec<String>,
}

/// Periodic liveness checker over a [`ConnectionRegistry`].
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    /// Create a monitor. Nothing runs until [`tick`](Self::tick) or
    /// [`spawn`](Self::spawn) is called.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, config: HeartbeatConfig) -> Self {
        Self { registry, config }
    }

    /// Run one sweep over the registry.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut entries = self.registry.lock();
        let mut doomed = Vec::new();

        for (client_id, entry) in entries.iter_mut() {
            if entry.closing {
                continue;
            }

            if !entry.transport().is_open() {
                debug!(client = %client_id, "Transport no longer open");
                doomed.push(client_id.clone());
                continue;
            }

            if !entry.responsive {
                entry.missed_pongs += 1;
                report.missed += 1;

                if entry.missed_pongs >= self.config.max_missed_pongs {
                    warn!(
                        client = %client_id,
                        missed = entry.missed_pongs,
                        "Heartbeat timeout, terminating"
                    );
                    entry.transport().terminate();
                    doomed.push(client_id.clone());
                    continue;
                }
            }

            entry.responsive = false;
            report.pinged += 1;
            if let Err(e) = entry.transport().ping() {
                // Eviction is left to the missed pong counter.
                debug!(client = %client_id, error = %e, "Ping failed");
            }
        }

        for client_id in doomed {
            if self.registry.remove_locked(&mut entries, &client_id) {
                report.evicted.push(client_id);
            }
        }

        report
    }

    /// Start ticking on the Tokio runtime.
    ///
    /// The first tick happens one full interval from now.
    #[must_use]
    pub fn spawn(self) -> HeartbeatHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(stop_rx));

        HeartbeatHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    async fn run(self, mut stop: oneshot::Receiver<()>) {
        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = period.as_millis() as u64,
            max_missed_pongs = self.config.max_missed_pongs,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut stop => break,

                _ = interval.tick() => {
                    let report = self.tick();
                    if report.evicted.is_empty() {
                        trace!(pinged = report.pinged, missed = report.missed, "Heartbeat tick");
                    } else {
                        info!(
                            pinged = report.pinged,
                            missed = report.missed,
                            evicted = ?report.evicted,
                            "Heartbeat tick evicted clients"
                        );
                    }
                }
            }
        }

        debug!("Heartbeat monitor stopped");
    }
}

/// Owner of the running heartbeat task.
///
/// Dropping the handle aborts the task.
pub struct HeartbeatHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Stop ticking and wait for the task to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Check if the task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
