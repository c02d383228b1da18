//! Connection registry
//!
//! Bookkeeping of live connections shared by the server loop and the
//! per-connection workers:
//! - The server loop inserts an entry when it dispatches a connection
//! - The returned [`RegistryEntry`] moves into the worker, and dropping it
//!   removes the entry, so every exit path unregisters exactly once
//! - Shutdown cancels every entry and waits on a condition variable until
//!   the registry drains

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::connection::{ConnectionId, ConnectionInfo, Phase};
use crate::transport::CancelToken;

// ============================================================================
// Registry Structure
// ============================================================================

struct Record {
    info: ConnectionInfo,
    phase: Phase,
    cancel: CancelToken,
    since: Instant,
}

/// Point-in-time view of one registered connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub info: ConnectionInfo,
    pub phase: Phase,
    pub age: Duration,
}

/// Registry of live connections
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, Record>>,
    /// Signalled on every insert and removal
    changed: Condvar,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a new empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(ConnectionRegistry {
            entries: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Record>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a dispatched connection.
    ///
    /// The returned entry owns the registration; drop it when the connection
    /// is finished.
    pub fn insert(
        self: &Arc<Self>,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        endpoint: usize,
        cancel: CancelToken,
    ) -> RegistryEntry {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = ConnectionInfo {
            id,
            peer_addr,
            local_addr,
            endpoint,
        };

        let count = {
            let mut entries = self.lock();
            entries.insert(
                id,
                Record {
                    info: info.clone(),
                    phase: Phase::Handshaking,
                    cancel: cancel.clone(),
                    since: Instant::now(),
                },
            );
            entries.len()
        };
        self.changed.notify_all();
        log::debug!("Registered connection {} from {} ({} live)", id, peer_addr, count);

        RegistryEntry {
            registry: Arc::clone(self),
            info,
            cancel,
        }
    }

    fn remove(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut entries = self.lock();
            let removed = entries.remove(&id).is_some();
            (removed, entries.len())
        };
        self.changed.notify_all();
        if removed {
            log::debug!("Unregistered connection {} ({} live)", id, count);
        }
        removed
    }

    fn set_phase(&self, id: ConnectionId, phase: Phase) {
        if let Some(record) = self.lock().get_mut(&id) {
            record.phase = phase;
        }
    }

    /// Number of live connections
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Live connections ordered by id
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut out: Vec<ConnectionSnapshot> = self
            .lock()
            .values()
            .map(|r| ConnectionSnapshot {
                info: r.info.clone(),
                phase: r.phase,
                age: r.since.elapsed(),
            })
            .collect();
        out.sort_by_key(|s| s.info.id);
        out
    }

    /// Cancel every live connection; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<CancelToken> = self.lock().values().map(|r| r.cancel.clone()).collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Block until `done(count)` holds or `timeout` elapses.
    /// Returns whether the condition was met.
    pub fn wait_until(&self, timeout: Duration, done: impl Fn(usize) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut entries = self.lock();
        loop {
            if done(entries.len()) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            entries = match self.changed.wait_timeout(entries, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Block until no connection is registered or `timeout` elapses
    pub fn wait_for_drain(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |count| count == 0)
    }
}

// ============================================================================
// Registry Entry
// ============================================================================

/// Owned registration of one connection; unregisters on drop
pub struct RegistryEntry {
    registry: Arc<ConnectionRegistry>,
    info: ConnectionInfo,
    cancel: CancelToken,
}

impl RegistryEntry {
    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn set_phase(&self, phase: Phase) {
        self.registry.set_phase(self.info.id, phase);
    }
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        self.registry.remove(self.info.id);
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry").field("info", &self.info).finish()
    }
}
