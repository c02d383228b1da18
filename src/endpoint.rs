//! Endpoint specifications and the multi-socket listener
//!
//! An endpoint is described by a `tcp://host:port?options` URI. Depending on
//! its mode, opening it yields either a listening [`Endpoint`] made of one
//! bound socket per resolved address (accept mode), or a single connected
//! stream (connect mode, listen-single mode).
//!
//! # Options
//!
//! ```text
//! listen               bind, wait for one inbound connection, return it
//! accept               bind every resolved address, accept repeatedly
//! timeout=<ticks>      connect timeout in 100 ms ticks (default 100 = 10 s)
//! listen_timeout=<ms>  listen-single wait bound, -1 = unbounded
//! backlog=<n>          listen queue length for accept mode
//! ```

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::str::FromStr;
use std::time::{Duration, Instant};

use mio::Interest;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::acceptor::PendingConnection;
use crate::mux;
use crate::resolve::{Resolver, SystemResolver};

// ============================================================================
// Constants
// ============================================================================

/// Default listen queue length for accept-mode endpoints
pub const DEFAULT_BACKLOG: u32 = 10;

/// Granularity of the connect readiness poll; also the unit of `timeout=`
pub const CONNECT_POLL_TICK: Duration = Duration::from_millis(100);

/// Default total connect timeout (100 ticks)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// URI scheme accepted by [`EndpointSpec::parse`]
const SCHEME: &str = "tcp";

// ============================================================================
// Endpoint Specification
// ============================================================================

/// How an endpoint is brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    /// Outbound connection to the first reachable candidate
    Connect,
    /// Bind, accept exactly one inbound connection, close the listener
    ListenSingle,
    /// Bind one socket per candidate and accept repeatedly
    ListenMultiAccept,
}

/// Named options attached to an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointOptions {
    pub connect_timeout: Duration,
    /// `None` waits indefinitely
    pub listen_timeout: Option<Duration>,
    pub backlog: u32,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        EndpointOptions {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            listen_timeout: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Immutable description of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    host: Option<String>,
    port: u16,
    mode: EndpointMode,
    options: EndpointOptions,
}

impl EndpointSpec {
    pub fn new(host: Option<&str>, port: u16, mode: EndpointMode, options: EndpointOptions) -> Self {
        EndpointSpec {
            host: host.filter(|h| !h.is_empty()).map(str::to_string),
            port,
            mode,
            options,
        }
    }

    /// Accept-mode endpoint with default options
    pub fn accept(host: Option<&str>, port: u16) -> Self {
        Self::new(host, port, EndpointMode::ListenMultiAccept, EndpointOptions::default())
    }

    /// Parse a `tcp://[host]:port[?options]` URI
    pub fn parse(uri: &str) -> Result<Self, EndpointError> {
        let invalid = |reason: &str| EndpointError::InvalidSpec(format!("{}: {}", uri, reason));

        let (scheme, rest) = uri.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme != SCHEME {
            return Err(invalid("unsupported scheme"));
        }

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        // Paths are accepted and ignored
        let authority = authority.split('/').next().unwrap_or_default();

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = tail.strip_prefix(':').ok_or_else(|| invalid("port missing"))?;
            (host, port)
        } else {
            authority.rsplit_once(':').ok_or_else(|| invalid("port missing"))?
        };
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
        if port == 0 {
            return Err(invalid("port missing"));
        }

        let mut mode = EndpointMode::Connect;
        let mut options = EndpointOptions::default();
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (pair, None),
            };
            match key {
                "listen" => {
                    if mode != EndpointMode::ListenMultiAccept {
                        mode = EndpointMode::ListenSingle;
                    }
                }
                "accept" => mode = EndpointMode::ListenMultiAccept,
                "timeout" => {
                    let ticks: u32 = parse_value(value).ok_or_else(|| invalid("invalid timeout"))?;
                    options.connect_timeout = CONNECT_POLL_TICK * ticks;
                }
                "listen_timeout" => {
                    let ms: i64 = parse_value(value).ok_or_else(|| invalid("invalid listen_timeout"))?;
                    options.listen_timeout = u64::try_from(ms).ok().map(Duration::from_millis);
                }
                "backlog" => {
                    options.backlog = parse_value(value).ok_or_else(|| invalid("invalid backlog"))?;
                }
                other => log::debug!("Ignoring unknown endpoint option '{}' in {}", other, uri),
            }
        }

        Ok(EndpointSpec::new(Some(host), port, mode, options))
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mode(&self) -> EndpointMode {
        self.mode
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }
}

fn parse_value<T: FromStr>(value: Option<&str>) -> Option<T> {
    value.and_then(|v| v.parse().ok())
}

impl FromStr for EndpointSpec {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointSpec::parse(s)
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.host.as_deref().unwrap_or("");
        if host.contains(':') {
            write!(f, "{}://[{}]:{}", SCHEME, host, self.port)?;
        } else {
            write!(f, "{}://{}:{}", SCHEME, host, self.port)?;
        }
        match self.mode {
            EndpointMode::Connect => Ok(()),
            EndpointMode::ListenSingle => write!(f, "?listen"),
            EndpointMode::ListenMultiAccept => write!(f, "?accept"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors while bringing an endpoint up
#[derive(Debug)]
pub enum EndpointError {
    /// Malformed endpoint URI or option value
    InvalidSpec(String),
    /// Resolution failed or produced no candidates
    AddressResolution { target: String, reason: String },
    /// Every candidate failed to create or bind a socket
    Bind { target: String, failures: Vec<(SocketAddr, io::Error)> },
    /// Every bound socket failed to enter the listening state
    Listen { target: String, failures: Vec<(SocketAddr, io::Error)> },
    /// Every candidate failed to connect (or accept, in listen-single mode)
    Connect { target: String, source: io::Error },
    /// Connect or listen-single wait exceeded its bound
    TimedOut { target: String },
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::InvalidSpec(msg) => write!(f, "invalid endpoint: {}", msg),
            EndpointError::AddressResolution { target, reason } => {
                write!(f, "failed to resolve {}: {}", target, reason)
            }
            EndpointError::Bind { target, failures } => {
                write!(f, "no socket could be bound for {}", target)?;
                write_failures(f, failures)
            }
            EndpointError::Listen { target, failures } => {
                write!(f, "no socket could listen for {}", target)?;
                write_failures(f, failures)
            }
            EndpointError::Connect { target, source } => {
                write!(f, "connection to {} failed: {}", target, source)
            }
            EndpointError::TimedOut { target } => write!(f, "timed out on {}", target),
        }
    }
}

fn write_failures(f: &mut fmt::Formatter<'_>, failures: &[(SocketAddr, io::Error)]) -> fmt::Result {
    for (i, (addr, err)) in failures.iter().enumerate() {
        write!(f, "{} {}: {}", if i == 0 { ":" } else { "," }, addr, err)?;
    }
    Ok(())
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EndpointError::Connect { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ============================================================================
// Listening Endpoint
// ============================================================================

/// One OS socket bound to one resolved address
#[derive(Debug)]
pub struct BoundSocket {
    socket: Socket,
    addr: SocketAddr,
    listening: bool,
}

impl BoundSocket {
    /// Bound local address (the real port when bound to port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl AsRawFd for BoundSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// A logical listening service made of one or more bound sockets
#[derive(Debug)]
pub struct Endpoint {
    spec: EndpointSpec,
    /// Never empty; order follows resolution order
    sockets: Vec<BoundSocket>,
}

impl Endpoint {
    /// Bind an accept-mode endpoint using the system resolver
    pub fn open(spec: &EndpointSpec) -> Result<Self, EndpointError> {
        Self::open_with(spec, &SystemResolver)
    }

    /// Bind one socket per resolved candidate.
    ///
    /// A candidate that fails to create or bind is logged and skipped; the
    /// endpoint fails only if no candidate could be bound.
    pub fn open_with(spec: &EndpointSpec, resolver: &dyn Resolver) -> Result<Self, EndpointError> {
        let target = spec.to_string();
        let candidates = resolve(spec, resolver)?;

        let mut sockets = Vec::with_capacity(candidates.len());
        let mut failures = Vec::new();
        for addr in candidates {
            match bind_socket(addr) {
                Ok(socket) => {
                    let local = socket
                        .local_addr()
                        .ok()
                        .and_then(|a| a.as_socket())
                        .unwrap_or(addr);
                    log::debug!("Bound {} for {}", local, target);
                    sockets.push(BoundSocket {
                        socket,
                        addr: local,
                        listening: false,
                    });
                }
                Err(e) => {
                    log::warn!("Skipping {} for {}: {}", addr, target, e);
                    failures.push((addr, e));
                }
            }
        }

        if sockets.is_empty() {
            return Err(EndpointError::Bind { target, failures });
        }

        Ok(Endpoint {
            spec: spec.clone(),
            sockets,
        })
    }

    /// Mark every bound socket as listening.
    ///
    /// `None` uses the spec's backlog option. Sockets that fail to listen are
    /// logged and dropped; the call fails only if none succeeds.
    pub fn listen(&mut self, backlog: Option<u32>) -> Result<(), EndpointError> {
        let backlog = backlog.unwrap_or(self.spec.options.backlog);
        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);

        let mut failures = Vec::new();
        let mut kept = Vec::with_capacity(self.sockets.len());
        for mut bound in self.sockets.drain(..) {
            if bound.listening {
                kept.push(bound);
                continue;
            }
            match bound.socket.listen(backlog) {
                Ok(()) => {
                    log::info!("Listening on {} (backlog {})", bound.addr, backlog);
                    bound.listening = true;
                    kept.push(bound);
                }
                Err(e) => {
                    log::warn!("Listen failed on {}: {}", bound.addr, e);
                    failures.push((bound.addr, e));
                }
            }
        }
        self.sockets = kept;

        if self.sockets.is_empty() {
            return Err(EndpointError::Listen {
                target: self.spec.to_string(),
                failures,
            });
        }
        Ok(())
    }

    pub fn spec(&self) -> &EndpointSpec {
        &self.spec
    }

    pub fn sockets(&self) -> &[BoundSocket] {
        &self.sockets
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().map(|s| s.addr).collect()
    }

    pub fn is_listening(&self) -> bool {
        self.sockets.iter().any(|s| s.listening)
    }

    pub(crate) fn listening_sockets(&self) -> impl Iterator<Item = &BoundSocket> {
        self.sockets.iter().filter(|s| s.listening)
    }
}

// ============================================================================
// Opening by Mode
// ============================================================================

/// Result of opening an endpoint of any mode
#[derive(Debug)]
pub enum Opened {
    /// Accept mode: bound, not yet listening
    Listener(Endpoint),
    /// Connect or listen-single mode: one established stream
    Stream(PendingConnection),
}

/// Open an endpoint according to its mode
pub fn open(spec: &EndpointSpec, resolver: &dyn Resolver) -> Result<Opened, EndpointError> {
    match spec.mode {
        EndpointMode::ListenMultiAccept => Endpoint::open_with(spec, resolver).map(Opened::Listener),
        EndpointMode::ListenSingle => listen_single(spec, resolver).map(Opened::Stream),
        EndpointMode::Connect => connect(spec, resolver).map(Opened::Stream),
    }
}

/// Bind the first candidate that succeeds, wait for one inbound connection
/// and return it. The listening socket is closed afterwards.
pub fn listen_single(spec: &EndpointSpec, resolver: &dyn Resolver) -> Result<PendingConnection, EndpointError> {
    let target = spec.to_string();
    let mut failures = Vec::new();

    for addr in resolve(spec, resolver)? {
        let socket = match bind_socket(addr).and_then(|s| s.listen(1).map(|_| s)) {
            Ok(socket) => socket,
            Err(e) => {
                log::debug!("Listen on {} failed: {}", addr, e);
                failures.push((addr, e));
                continue;
            }
        };

        let ready = mux::wait_fd(socket.as_raw_fd(), Interest::READABLE, spec.options.listen_timeout)
            .map_err(|source| EndpointError::Connect { target: target.clone(), source })?;
        if !ready {
            return Err(EndpointError::TimedOut { target });
        }

        let (stream, peer) = socket
            .accept()
            .map_err(|source| EndpointError::Connect { target: target.clone(), source })?;
        let local_addr = socket.local_addr().ok().and_then(|a| a.as_socket()).unwrap_or(addr);
        let peer_addr = peer.as_socket().unwrap_or(addr);
        log::info!("Accepted single connection from {} on {}", peer_addr, local_addr);

        return Ok(PendingConnection {
            stream: TcpStream::from(stream),
            peer_addr,
            local_addr,
            endpoint: 0,
        });
    }

    Err(EndpointError::Bind { target, failures })
}

/// Connect to the first reachable candidate.
///
/// Each attempt is a non-blocking connect polled in [`CONNECT_POLL_TICK`]
/// steps up to the spec's connect timeout.
pub fn connect(spec: &EndpointSpec, resolver: &dyn Resolver) -> Result<PendingConnection, EndpointError> {
    let target = spec.to_string();
    let mut last_error: Option<io::Error> = None;

    for addr in resolve(spec, resolver)? {
        match connect_one(addr, spec.options.connect_timeout) {
            Ok(stream) => {
                let local_addr = stream.local_addr().unwrap_or(addr);
                log::info!("Connected to {}", addr);
                return Ok(PendingConnection {
                    stream,
                    peer_addr: addr,
                    local_addr,
                    endpoint: 0,
                });
            }
            Err(e) => {
                log::warn!("TCP connection to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => Err(EndpointError::TimedOut { target }),
        Some(source) => Err(EndpointError::Connect { target, source }),
        None => Err(EndpointError::AddressResolution {
            target,
            reason: "no candidate addresses".to_string(),
        }),
    }
}

fn connect_one(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {
            let deadline = Instant::now() + timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
                let tick = CONNECT_POLL_TICK.min(deadline - now);
                if mux::wait_fd(socket.as_raw_fd(), Interest::WRITABLE, Some(tick))? {
                    break;
                }
            }
            if let Some(err) = socket.take_error()? {
                return Err(err);
            }
        }
        Err(e) => return Err(e),
    }

    Ok(TcpStream::from(socket))
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
        || err.raw_os_error() == Some(libc::EINPROGRESS)
}

fn resolve(spec: &EndpointSpec, resolver: &dyn Resolver) -> Result<Vec<SocketAddr>, EndpointError> {
    let target = spec.to_string();
    let candidates = resolver
        .resolve(spec.host(), spec.port)
        .map_err(|e| EndpointError::AddressResolution {
            target: target.clone(),
            reason: e.to_string(),
        })?;
    if candidates.is_empty() {
        return Err(EndpointError::AddressResolution {
            target,
            reason: "no candidate addresses".to_string(),
        });
    }
    log::debug!("Resolved {} to {:?}", target, candidates);
    Ok(candidates)
}

fn bind_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
