//! Connection worker
//!
//! Post-handshake read loop. Received bytes go to a [`StreamSink`], the seam
//! where a message-layer demuxer plugs in; the default sink discards them.

use std::fmt;
use std::io;
use std::sync::atomic::Ordering;

use crate::connection::Connection;
use crate::metrics::Metrics;
use crate::registry::RegistryEntry;
use crate::transport::Transport;

/// Scratch buffer size for payload reads
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Sink
// ============================================================================

/// Consumer of the authenticated byte stream
pub trait StreamSink: Send {
    fn consume(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Sink that drops every byte
#[derive(Debug, Default)]
pub struct DiscardSink;

impl StreamSink for DiscardSink {
    fn consume(&mut self, data: &[u8]) -> io::Result<()> {
        log::trace!("Discarding {} payload bytes", data.len());
        Ok(())
    }
}

// ============================================================================
// Exit and Errors
// ============================================================================

/// Normal worker termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Peer closed the stream
    PeerClosed,
    /// Cancelled by the server (shutdown)
    Cancelled,
}

#[derive(Debug)]
pub enum ConnectionError {
    /// Socket read failed
    Read(io::Error),
    /// Sink rejected data
    Sink(io::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Read(e) => write!(f, "read failed: {}", e),
            ConnectionError::Sink(e) => write!(f, "sink rejected data: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Read(e) | ConnectionError::Sink(e) => Some(e),
        }
    }
}

// ============================================================================
// Serve
// ============================================================================

/// Read from `conn` until the peer closes, the entry is cancelled or an
/// error occurs.
///
/// Consumes the registry entry: the connection is unregistered and its
/// socket closed on every exit path.
pub fn serve<T: Transport>(
    mut conn: Connection<T>,
    entry: RegistryEntry,
    sink: &mut dyn StreamSink,
    buffer_size: usize,
    metrics: &Metrics,
) -> Result<WorkerExit, ConnectionError> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total: u64 = 0;
    conn.transport_mut().set_deadline(None);

    let result = loop {
        match conn.read(&mut buf) {
            Ok(0) => break Ok(WorkerExit::PeerClosed),
            Ok(n) => {
                total += n as u64;
                metrics.bytes_received_total.fetch_add(n as u64, Ordering::Relaxed);
                log::trace!("conn={} received {} bytes", entry.id(), n);
                if let Err(e) = sink.consume(&buf[..n]) {
                    break Err(ConnectionError::Sink(e));
                }
            }
            Err(_) if entry.cancel_token().is_cancelled() => break Ok(WorkerExit::Cancelled),
            Err(e) => break Err(ConnectionError::Read(e)),
        }
    };

    match &result {
        Ok(exit) => log::info!(
            "Connection {} from {} finished ({:?}, {} bytes)",
            entry.id(),
            conn.info().peer_addr,
            exit,
            total
        ),
        Err(e) => log::warn!(
            "Connection {} from {} failed after {} bytes: {}",
            entry.id(),
            conn.info().peer_addr,
            total,
            e
        ),
    }

    if let Err(e) = conn.transport_mut().close() {
        log::debug!("Close of connection {} failed: {}", entry.id(), e);
    }
    result
}
