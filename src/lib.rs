//! avserv: TCP ingest front end for media streams
//!
//! Listens on one or more endpoints, each made of one socket per resolved
//! address, and authenticates every inbound connection with a three-round
//! version/epoch/nonce handshake before handing the byte stream to a
//! per-connection worker.
//!
//! # Layout
//! - [`mux`]: readiness multiplexing over raw fds
//! - [`resolve`]: host/port to candidate addresses
//! - [`endpoint`]: endpoint URIs, multi-socket bind/listen, connect mode
//! - [`acceptor`]: one bounded accept over many endpoints
//! - [`transport`]: blocking byte-stream capability and cancellation
//! - [`handshake`]: the handshake state machine
//! - [`worker`]: post-handshake read loop
//! - [`registry`]: live connection bookkeeping
//! - [`server`]: accept loop, dispatch and shutdown

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod handshake;
pub mod metrics;
pub mod mux;
pub mod registry;
pub mod resolve;
pub mod server;
pub mod transport;
pub mod worker;

pub use acceptor::{accept, AcceptError, AcceptOutcome, PendingConnection};
pub use config::{CliArgs, ConfigError, ServerConfig};
pub use connection::{Connection, ConnectionId, ConnectionInfo, Phase};
pub use endpoint::{Endpoint, EndpointError, EndpointMode, EndpointOptions, EndpointSpec};
pub use handshake::{Handshake, HandshakeError, HandshakeState};
pub use metrics::Metrics;
pub use registry::{ConnectionRegistry, RegistryEntry};
pub use server::{Server, ServerError, SinkFactory};
pub use transport::{CancelToken, TcpTransport, Transport};
pub use worker::{serve, ConnectionError, StreamSink, WorkerExit};
