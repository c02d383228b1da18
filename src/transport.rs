//! Byte-stream transport capability
//!
//! The handshake engine and the worker only need a small set of blocking
//! operations on a connection. [`Transport`] captures them; [`TcpTransport`]
//! implements them over a non-blocking TCP socket and a per-connection
//! [`Multiplexer`], which also carries the cancellation waker.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mio::{Interest, Waker};

use crate::mux::Multiplexer;

/// Upper bound on bytes inspected by [`Transport::pending`]
const PEEK_LIMIT: usize = 4096;

// ============================================================================
// Transport Trait
// ============================================================================

/// Blocking duplex byte stream
pub trait Transport: Send {
    /// Read at least one byte, waiting for readiness as needed.
    /// `Ok(0)` means the peer closed the connection.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf`, waiting for readiness as needed. Returns the number of
    /// bytes the peer accepted, which is less than `buf.len()` only if the
    /// stream stopped taking data.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Number of bytes already buffered and readable without waiting
    fn pending(&mut self) -> io::Result<usize>;

    /// Bound every subsequent wait by `deadline` (`None` = unbounded).
    /// An expired wait fails with `ErrorKind::TimedOut`.
    fn set_deadline(&mut self, deadline: Option<Instant>);

    fn close(&mut self) -> io::Result<()>;

    /// Underlying OS handle, if any
    fn handle(&self) -> Option<RawFd>;
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared flag that stops a connection's blocking waits
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waker: Mutex<Option<Arc<Waker>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake the attached multiplexer, if any
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Attach the waker of the multiplexer that blocks on this token's behalf
    pub(crate) fn attach(&self, waker: Arc<Waker>) {
        *self.inner.waker.lock().unwrap_or_else(|e| e.into_inner()) = Some(waker);
        // Cancelled before the waker existed
        if self.is_cancelled() {
            self.wake();
        }
    }

    fn wake(&self) {
        let guard = self.inner.waker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(waker) = guard.as_ref() {
            if let Err(e) = waker.wake() {
                log::warn!("Failed to wake cancelled connection: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection cancelled")
}

fn timed_out_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection wait timed out")
}

// ============================================================================
// TCP Transport
// ============================================================================

/// [`Transport`] over a TCP stream
pub struct TcpTransport {
    stream: TcpStream,
    mux: Multiplexer,
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl TcpTransport {
    /// Switch `stream` to non-blocking mode and register it for readiness.
    /// `cancel` can interrupt any wait from another thread.
    pub fn new(stream: TcpStream, cancel: CancelToken) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let mut mux = Multiplexer::new()?;
        mux.add(stream.as_raw_fd(), Interest::READABLE | Interest::WRITABLE)?;
        cancel.attach(mux.waker()?);
        Ok(TcpTransport {
            stream,
            mux,
            cancel,
            deadline: None,
        })
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }

    /// Block until the socket reports readiness, the deadline passes or the
    /// connection is cancelled. Only called after a `WouldBlock`.
    fn wait_ready(&mut self) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_error());
        }
        let timeout = match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(timed_out_error());
                }
                Some(deadline - now)
            }
            None => None,
        };
        self.mux.wait(timeout)?;
        if self.cancel.is_cancelled() {
            return Err(cancelled_error());
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_error());
        }
        loop {
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_ready()?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_error());
        }
        let mut written = 0;
        while written < buf.len() {
            match self.stream.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_ready()?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn pending(&mut self) -> io::Result<usize> {
        let mut scratch = [0u8; PEEK_LIMIT];
        match self.stream.peek(&mut scratch) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn handle(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn transport_pair() -> (TcpStream, TcpTransport, CancelToken) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let cancel = CancelToken::new();
        let transport = TcpTransport::new(server, cancel.clone()).unwrap();
        (client, transport, cancel)
    }

    #[test]
    fn test_read_waits_for_data() {
        let (mut client, mut transport, _cancel) = transport_pair();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            client.write_all(b"hello").unwrap();
            client
        });

        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        drop(handle.join().unwrap());

        // Peer gone: end of stream
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_and_pending() {
        let (mut client, mut transport, _cancel) = transport_pair();
        assert_eq!(transport.write(b"abc").unwrap(), 3);
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        assert_eq!(transport.pending().unwrap(), 0);
        client.write_all(&[7u8; 10]).unwrap();
        // Give loopback a moment to deliver
        for _ in 0..100 {
            if transport.pending().unwrap() == 10 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(transport.pending().unwrap(), 10);
    }

    #[test]
    fn test_deadline_bounds_read() {
        let (_client, mut transport, _cancel) = transport_pair();
        transport.set_deadline(Some(Instant::now() + Duration::from_millis(30)));
        let mut buf = [0u8; 4];
        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_cancel_interrupts_blocked_read() {
        let (_client, mut transport, cancel) = transport_pair();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            transport.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_cancel_before_attach_is_observed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut transport = TcpTransport::new(server, cancel).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            transport.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::ConnectionAborted
        );
    }

    #[test]
    fn test_close_and_handle() {
        let (mut client, mut transport, _cancel) = transport_pair();
        assert!(transport.handle().is_some());
        transport.close().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
