//! Server loop
//!
//! Brings every configured endpoint up, then accepts in round robin across
//! them and hands each connection to its own thread, which runs the
//! handshake and then the worker. Shutdown is requested through a shared
//! flag; the loop then cancels every live connection and waits for the
//! registry to drain.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::acceptor::{self, AcceptOutcome, PendingConnection};
use crate::config::{ConfigError, ServerConfig};
use crate::connection::{ConnectionInfo, Phase};
use crate::endpoint::{Endpoint, EndpointError};
use crate::handshake::Handshake;
use crate::metrics::Metrics;
use crate::registry::{ConnectionRegistry, RegistryEntry};
use crate::resolve::{Resolver, SystemResolver};
use crate::transport::{CancelToken, TcpTransport};
use crate::worker::{self, DiscardSink, StreamSink};

/// Pause after a failed accept call before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Builds the sink that receives one connection's payload
pub type SinkFactory = Arc<dyn Fn(&ConnectionInfo) -> Box<dyn StreamSink> + Send + Sync>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    /// An endpoint could not be brought up
    Endpoint(EndpointError),
    /// `run` was called after the listeners were closed
    NotListening,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "configuration error: {}", e),
            ServerError::Endpoint(e) => write!(f, "endpoint bring-up failed: {}", e),
            ServerError::NotListening => write!(f, "server has no open listeners"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Endpoint(e) => Some(e),
            ServerError::NotListening => None,
        }
    }
}

impl From<EndpointError> for ServerError {
    fn from(e: EndpointError) -> Self {
        ServerError::Endpoint(e)
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

// ============================================================================
// Server Structure
// ============================================================================

pub struct Server {
    endpoints: Vec<Endpoint>,
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
    sink_factory: SinkFactory,
    /// Endpoint the next accept call starts scanning from
    next: usize,
}

/// What each connection thread needs from the server
#[derive(Clone)]
struct Dispatch {
    metrics: Arc<Metrics>,
    sink_factory: SinkFactory,
    handshake_timeout: Option<Duration>,
    read_buffer_size: usize,
}

impl Server {
    /// Validate `config`, bind every endpoint and start listening
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_with(config, &SystemResolver)
    }

    /// [`Server::bind`] with a custom resolver
    pub fn bind_with(config: ServerConfig, resolver: &dyn Resolver) -> Result<Self, ServerError> {
        config.validate()?;

        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for spec in &config.endpoints {
            let mut endpoint = Endpoint::open_with(spec, resolver)?;
            endpoint.listen(None)?;
            log::info!("Endpoint {} up on {:?}", spec, endpoint.local_addrs());
            endpoints.push(endpoint);
        }

        Ok(Server {
            endpoints,
            config,
            registry: ConnectionRegistry::new(),
            metrics: Arc::new(Metrics::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            sink_factory: Arc::new(|_: &ConnectionInfo| Box::new(DiscardSink) as Box<dyn StreamSink>),
            next: 0,
        })
    }

    /// Replace the default discarding sink
    pub fn with_sink_factory(mut self, factory: SinkFactory) -> Self {
        self.sink_factory = factory;
        self
    }

    /// Flag that stops [`Server::run`] when set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Bound addresses of endpoint `index`
    pub fn local_addrs(&self, index: usize) -> Vec<SocketAddr> {
        self.endpoints
            .get(index)
            .map(Endpoint::local_addrs)
            .unwrap_or_default()
    }

    // ========================================================================
    // Main Loop
    // ========================================================================

    /// Accept and dispatch until the shutdown flag is set, then cancel all
    /// connections and wait up to the grace period for them to finish.
    pub fn run(&mut self) -> Result<(), ServerError> {
        if self.endpoints.is_empty() {
            return Err(ServerError::NotListening);
        }
        log::info!("Accepting on {} endpoint(s)", self.endpoints.len());

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.accept_next() {
                Ok(Some(pending)) => self.dispatch(pending),
                Ok(None) => {}
                Err(e) => {
                    self.metrics.accept_errors_total.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }

        self.shutdown_connections();
        Ok(())
    }

    /// One acceptor call with the endpoint order rotated to start at
    /// `self.next`
    fn accept_next(&mut self) -> Result<Option<PendingConnection>, acceptor::AcceptError> {
        let count = self.endpoints.len();
        let order: Vec<&Endpoint> = (0..count)
            .map(|i| &self.endpoints[(self.next + i) % count])
            .collect();

        match acceptor::accept(&order, Some(self.config.accept_timeout))? {
            AcceptOutcome::Timeout => Ok(None),
            AcceptOutcome::Accepted(mut pending) => {
                pending.endpoint = (self.next + pending.endpoint) % count;
                self.next = (pending.endpoint + 1) % count;
                Ok(Some(pending))
            }
        }
    }

    fn dispatch(&self, pending: PendingConnection) {
        self.metrics.connections_accepted_total.fetch_add(1, Ordering::Relaxed);
        let PendingConnection {
            stream,
            peer_addr,
            local_addr,
            endpoint,
        } = pending;

        let cancel = CancelToken::new();
        let transport = match TcpTransport::new(stream, cancel.clone()) {
            Ok(t) => t,
            Err(e) => {
                self.metrics.spawn_failures_total.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping connection from {}: {}", peer_addr, e);
                return;
            }
        };

        let entry = self.registry.insert(peer_addr, local_addr, endpoint, cancel);
        let id = entry.id();
        log::info!("Connection {} from {} on {}", id, peer_addr, local_addr);

        let dispatch = Dispatch {
            metrics: Arc::clone(&self.metrics),
            sink_factory: Arc::clone(&self.sink_factory),
            handshake_timeout: self.config.handshake_timeout,
            read_buffer_size: self.config.read_buffer_size,
        };
        self.metrics.active_connections.fetch_add(1, Ordering::Relaxed);

        let spawned = thread::Builder::new()
            .name(format!("conn-{}", id))
            .spawn(move || handle_connection(transport, entry, dispatch));
        if let Err(e) = spawned {
            // The closure, and with it the registry entry, is already dropped
            self.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
            self.metrics.spawn_failures_total.fetch_add(1, Ordering::Relaxed);
            log::error!("Failed to spawn worker for connection {}: {}", id, e);
        }
    }

    fn shutdown_connections(&mut self) {
        log::info!("Shutting down");
        self.endpoints.clear();

        let cancelled = self.registry.cancel_all();
        if cancelled == 0 {
            return;
        }
        log::info!("Cancelled {} connection(s), waiting up to {:?}", cancelled, self.config.shutdown_grace);

        let started = Instant::now();
        if self.registry.wait_for_drain(self.config.shutdown_grace) {
            log::info!("All connections closed in {:?}", started.elapsed());
        } else {
            log::warn!("{} connection(s) still open after grace period", self.registry.count());
        }
    }
}

// ============================================================================
// Per-Connection Unit
// ============================================================================

fn handle_connection(transport: TcpTransport, entry: RegistryEntry, dispatch: Dispatch) {
    let metrics = &dispatch.metrics;
    let info = entry.info().clone();

    match Handshake::new(transport, info.clone(), dispatch.handshake_timeout).run() {
        Ok(conn) => {
            metrics.handshakes_completed_total.fetch_add(1, Ordering::Relaxed);
            entry.set_phase(Phase::Serving);
            let mut sink = (dispatch.sink_factory)(&info);
            match worker::serve(conn, entry, sink.as_mut(), dispatch.read_buffer_size, metrics) {
                Ok(exit) => log::debug!("Worker for {} exited: {:?}", info.peer_addr, exit),
                Err(e) => log::debug!("Worker for {} ended with error: {}", info.peer_addr, e),
            }
        }
        Err(e) => {
            metrics.handshakes_failed_total.fetch_add(1, Ordering::Relaxed);
            if entry.cancel_token().is_cancelled() {
                log::debug!("Handshake with {} cancelled", info.peer_addr);
            } else {
                log::info!("Handshake with {} failed: {}", info.peer_addr, e);
            }
            drop(entry);
        }
    }

    metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointSpec;
    use crate::handshake::{HANDSHAKE_PACKET_SIZE, PROTOCOL_VERSION};
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn loopback_config(endpoints: usize) -> ServerConfig {
        ServerConfig {
            endpoints: (0..endpoints)
                .map(|_| EndpointSpec::accept(Some("127.0.0.1"), 0))
                .collect(),
            accept_timeout: Duration::from_millis(50),
            handshake_timeout: Some(Duration::from_secs(5)),
            read_buffer_size: 4096,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_bind_reports_addresses() {
        let server = Server::bind(loopback_config(2)).unwrap();
        let a = server.local_addrs(0);
        let b = server.local_addrs(1);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].port(), 0);
        assert_ne!(a[0], b[0]);
        assert!(server.local_addrs(2).is_empty());
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let mut config = loopback_config(1);
        config.endpoints.clear();
        assert!(matches!(Server::bind(config), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_round_robin_accept() {
        let mut server = Server::bind(loopback_config(2)).unwrap();
        let a = server.local_addrs(0)[0];
        let b = server.local_addrs(1)[0];

        let _ca1 = TcpStream::connect(a).unwrap();
        let _ca2 = TcpStream::connect(a).unwrap();
        let _cb = TcpStream::connect(b).unwrap();

        let mut seen = Vec::new();
        for _ in 0..20 {
            if let Some(p) = server.accept_next().unwrap() {
                seen.push(p.endpoint);
            }
            if seen.len() == 3 {
                break;
            }
        }
        seen.truncate(2);
        // Endpoint 1 is served before endpoint 0's second connection
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_bad_version_counted_as_failure() {
        let mut server = Server::bind(loopback_config(1)).unwrap();
        let addr = server.local_addrs(0)[0];
        let metrics = server.metrics();
        let registry = server.registry();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&[6]).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        assert!(wait_for(|| metrics.handshakes_failed_total.load(Ordering::Relaxed) == 1));
        assert!(registry.wait_for_drain(Duration::from_secs(2)));

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
        assert_eq!(metrics.connections_accepted_total.load(Ordering::Relaxed), 1);
        assert!(wait_for(|| metrics.active_connections.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn test_shutdown_cancels_stalled_handshake() {
        let mut config = loopback_config(1);
        config.handshake_timeout = None;
        let mut server = Server::bind(config).unwrap();
        let addr = server.local_addrs(0)[0];
        let registry = server.registry();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&[PROTOCOL_VERSION]).unwrap();
        let mut s0 = [0u8; 1];
        client.read_exact(&mut s0).unwrap();
        // Stall before C1
        assert!(wait_for(|| registry.count() == 1));

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
        assert!(registry.is_empty());

        let mut rest = [0u8; HANDSHAKE_PACKET_SIZE];
        assert_eq!(client.read(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_run_after_shutdown_is_not_listening() {
        let mut server = Server::bind(loopback_config(1)).unwrap();
        server.shutdown_handle().store(true, Ordering::SeqCst);
        server.run().unwrap();
        assert!(matches!(server.run(), Err(ServerError::NotListening)));
    }
}
