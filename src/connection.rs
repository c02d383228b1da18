//! Connection metadata and the authenticated connection type

use std::io;
use std::net::SocketAddr;

use crate::transport::Transport;

/// Registry-assigned connection identifier
pub type ConnectionId = u64;

// ============================================================================
// Connection Phase
// ============================================================================

/// Lifecycle phase of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepted, handshake in progress
    Handshaking,
    /// Handshake complete, worker reading data
    Serving,
}

// ============================================================================
// Connection Info
// ============================================================================

/// Peer metadata handed along with an accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    /// Local address of the socket the connection arrived on
    pub local_addr: SocketAddr,
    /// Index of the configured endpoint the connection arrived on
    pub endpoint: usize,
}

// ============================================================================
// Connection
// ============================================================================

/// A connection that completed the handshake.
///
/// Only the handshake engine creates these; the transport is owned
/// exclusively from then on.
pub struct Connection<T: Transport> {
    transport: T,
    info: ConnectionInfo,
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(transport: T, info: ConnectionInfo) -> Self {
        Connection { transport, info }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Read payload bytes; `Ok(0)` means the peer closed
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.read(buf)
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the stream to a message-layer consumer
    pub fn into_parts(self) -> (T, ConnectionInfo) {
        (self.transport, self.info)
    }
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("info", &self.info).finish()
    }
}
