//! In-memory transport.
//!
//! Records everything written to it instead of touching a socket. The test
//! suites and benchmarks drive the registry with it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::traits::{ConnectionId, Transport, TransportError};

/// A transport that keeps its output in memory.
#[derive(Debug)]
pub struct MemoryTransport {
    id: ConnectionId,
    remote_addr: Option<String>,
    open: AtomicBool,
    fail_writes: AtomicBool,
    pings: AtomicUsize,
    terminations: AtomicUsize,
    sent: Mutex<Vec<String>>,
}

impl MemoryTransport {
    /// Create an open transport with a generated id.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Create an open transport reporting the given remote address.
    #[must_use]
    pub fn with_remote_addr(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(Some(addr.into())))
    }

    fn build(remote_addr: Option<String>) -> Self {
        Self {
            id: ConnectionId::generate(),
            remote_addr,
            open: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Text messages written so far.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Number of pings written so far.
    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Number of times `terminate` was called.
    #[must_use]
    pub fn terminate_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Whether `terminate` was called at least once.
    #[must_use]
    pub fn was_terminated(&self) -> bool {
        self.terminate_count() > 0
    }

    /// Simulate the peer closing the connection.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Make subsequent writes fail while the transport stays open.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("simulated write failure".into()));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.check_writable()?;
        self.sent.lock().push(text);
        Ok(())
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.check_writable()?;
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn terminate(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}
