//! Acceptor: one bounded wait over every listening socket of several endpoints
//!
//! Each call builds a fresh wait set, so the acceptor keeps no state between
//! calls. Rotating the endpoint order between calls (round robin) is the
//! caller's job.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

use mio::Interest;

use crate::endpoint::Endpoint;
use crate::mux::Multiplexer;

// ============================================================================
// Types
// ============================================================================

/// A raw, unauthenticated inbound connection
#[derive(Debug)]
pub struct PendingConnection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    /// Local address of the socket the connection arrived on
    pub local_addr: SocketAddr,
    /// Index of the endpoint, within the slice passed to [`accept`]
    pub endpoint: usize,
}

/// Outcome of one accept call
#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted(PendingConnection),
    /// Nothing arrived within the timeout; not an error
    Timeout,
}

/// Per-call accept failure
#[derive(Debug)]
pub enum AcceptError {
    /// None of the endpoints has a listening socket
    NoListeners,
    /// Building or waiting on the wait set failed
    Wait(io::Error),
    /// `accept` failed on the ready socket
    Accept {
        endpoint: usize,
        local_addr: SocketAddr,
        source: io::Error,
    },
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::NoListeners => write!(f, "no listening sockets to accept on"),
            AcceptError::Wait(e) => write!(f, "readiness wait failed: {}", e),
            AcceptError::Accept { local_addr, source, .. } => {
                write!(f, "unable to accept on {}: {}", local_addr, source)
            }
        }
    }
}

impl std::error::Error for AcceptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AcceptError::NoListeners => None,
            AcceptError::Wait(e) => Some(e),
            AcceptError::Accept { source, .. } => Some(source),
        }
    }
}

// ============================================================================
// Accept
// ============================================================================

/// Wait up to `timeout` for an inbound connection on any listening socket of
/// `endpoints` and accept it.
///
/// Ready sockets are scanned in registration order (endpoint order, then
/// socket order) and the first one that yields a connection wins. A socket
/// that turns out to have nothing pending is skipped. Hard accept failures
/// are returned, never retried.
pub fn accept(endpoints: &[&Endpoint], timeout: Option<Duration>) -> Result<AcceptOutcome, AcceptError> {
    let mut mux = Multiplexer::new().map_err(AcceptError::Wait)?;
    let mut slots = Vec::new();
    for (index, endpoint) in endpoints.iter().enumerate() {
        for bound in endpoint.listening_sockets() {
            mux.add(bound.as_raw_fd(), Interest::READABLE)
                .map_err(AcceptError::Wait)?;
            slots.push((index, bound));
        }
    }
    if slots.is_empty() {
        return Err(AcceptError::NoListeners);
    }

    let ready = mux.wait(timeout).map_err(AcceptError::Wait)?;
    for r in ready.iter().filter(|r| r.readable && !r.is_wake()) {
        let Some(&(index, bound)) = slots.get(r.token.0) else {
            continue;
        };
        match bound.socket().accept() {
            Ok((socket, peer)) => {
                let peer_addr = match peer.as_socket() {
                    Some(addr) => addr,
                    None => {
                        log::debug!("Dropping connection with non-IP peer on {}", bound.local_addr());
                        continue;
                    }
                };
                log::debug!("Accepted {} on {}", peer_addr, bound.local_addr());
                return Ok(AcceptOutcome::Accepted(PendingConnection {
                    stream: TcpStream::from(socket),
                    peer_addr,
                    local_addr: bound.local_addr(),
                    endpoint: index,
                }));
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => continue,
            Err(source) => {
                return Err(AcceptError::Accept {
                    endpoint: index,
                    local_addr: bound.local_addr(),
                    source,
                })
            }
        }
    }

    Ok(AcceptOutcome::Timeout)
}
