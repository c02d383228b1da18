//! Readiness multiplexing over raw file descriptors
//!
//! A thin layer over a mio `Poll`. Sources are registered by raw fd through
//! `SourceFd`, so any socket type can join a wait set and a throwaway wait set
//! can be built for a single call without touching the socket objects.
//!
//! mio registrations are edge-triggered: a persistent registration only
//! reports a source again after it has been drained to `WouldBlock`.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of events collected per wait
const EVENTS_CAPACITY: usize = 64;

/// Token reserved for the cancellation waker
pub const WAKE_TOKEN: Token = Token(usize::MAX);

// ============================================================================
// Readiness Report
// ============================================================================

/// Readiness of one registered source after a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    /// Token returned by [`Multiplexer::add`] (or [`WAKE_TOKEN`])
    pub token: Token,
    /// Readable, or the read half was closed by the peer
    pub readable: bool,
    /// Writable, or the write half was closed
    pub writable: bool,
    /// Socket reported an error condition
    pub error: bool,
}

impl Ready {
    /// Whether this report came from the waker rather than a socket
    pub fn is_wake(&self) -> bool {
        self.token == WAKE_TOKEN
    }
}

// ============================================================================
// Multiplexer
// ============================================================================

/// Blocks until one of several file descriptors becomes ready or a timeout
/// elapses.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    /// Number of sources registered so far (next token value)
    sources: usize,
    waker: Option<Arc<Waker>>,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        Ok(Multiplexer {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            sources: 0,
            waker: None,
        })
    }

    /// Add a file descriptor to the wait set.
    ///
    /// Tokens are handed out in registration order starting at zero, which
    /// gives callers a deterministic scan order over the results of [`wait`].
    ///
    /// [`wait`]: Multiplexer::wait
    pub fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<Token> {
        let token = Token(self.sources);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)?;
        self.sources += 1;
        Ok(token)
    }

    /// Number of file descriptors in the wait set
    pub fn len(&self) -> usize {
        self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.sources == 0
    }

    /// Get (creating on first use) the waker that interrupts [`wait`] from
    /// another thread. A wake is reported with [`WAKE_TOKEN`].
    ///
    /// [`wait`]: Multiplexer::wait
    pub fn waker(&mut self) -> io::Result<Arc<Waker>> {
        if let Some(waker) = &self.waker {
            return Ok(Arc::clone(waker));
        }
        let waker = Arc::new(Waker::new(self.poll.registry(), WAKE_TOKEN)?);
        self.waker = Some(Arc::clone(&waker));
        Ok(waker)
    }

    /// Wait for readiness.
    ///
    /// `None` waits indefinitely. An empty result means the timeout elapsed
    /// or the wait was interrupted by a signal. Results are ordered by token.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut ready: Vec<Ready> = self
            .events
            .iter()
            .map(|event| Ready {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
                error: event.is_error(),
            })
            .collect();
        ready.sort_by_key(|r| r.token);
        Ok(ready)
    }
}

/// Wait for a single file descriptor with a one-shot wait set.
///
/// Returns `true` if the descriptor became ready before the timeout.
pub fn wait_fd(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
    let mut mux = Multiplexer::new()?;
    mux.add(fd, interest)?;
    let ready = mux.wait(timeout)?;
    Ok(!ready.is_empty())
}
