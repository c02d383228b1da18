//! Three-round handshake engine
//!
//! Runs once per accepted connection, before any media data is trusted.
//!
//! # Protocol Flow
//!
//! ```text
//! Client                               Server
//!   │──── C0: version (1) ─────────────►│  Uninitialized → VersionSent
//!   │◄─── S0: version echo (1) ─────────│
//!   │──── C1: epoch|0|random (1536) ───►│  VersionSent → AckSent
//!   │◄─── S1: epoch|0|nonce (1536) ─────│
//!   │──── C2: S1 epoch|*|S1 nonce ─────►│  AckSent → Established
//!   │◄─── S2: C1 epoch|0|C1 random ─────│
//! ```
//!
//! All integers are big-endian. Every step reads first and writes only after
//! its read validated; a failed step never writes.

use std::fmt;
use std::io;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ring::rand::{SecureRandom, SystemRandom};

use crate::connection::{Connection, ConnectionInfo};
use crate::transport::Transport;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version carried in C0/S0
pub const PROTOCOL_VERSION: u8 = 3;

/// Size of C1/S1/C2/S2
pub const HANDSHAKE_PACKET_SIZE: usize = 1536;

/// Random payload following the epoch and zero fields
pub const NONCE_SIZE: usize = HANDSHAKE_PACKET_SIZE - 8;

// ============================================================================
// State
// ============================================================================

/// Handshake progress. Strictly monotonic; `Established` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Uninitialized,
    VersionSent,
    AckSent,
    Established,
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Established | HandshakeState::Failed)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Uninitialized => "Uninitialized",
            HandshakeState::VersionSent => "VersionSent",
            HandshakeState::AckSent => "AckSent",
            HandshakeState::Established => "Established",
            HandshakeState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Field that failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeField {
    /// C0 version byte
    Version,
    /// C1 bytes 4..8
    ZeroField,
    /// C2 bytes 0..4 against our epoch
    EpochEcho,
    /// C2 bytes 8..1536 against our nonce
    NonceEcho,
}

// ============================================================================
// Errors
// ============================================================================

/// Handshake failure. Fatal to the one connection only.
#[derive(Debug)]
pub enum HandshakeError {
    /// Zero-length read: the peer closed the connection
    PeerClosed { state: HandshakeState },
    /// Block shorter or longer than the step expects
    SizeMismatch {
        state: HandshakeState,
        expected: usize,
        actual: usize,
    },
    FieldMismatch {
        state: HandshakeState,
        field: HandshakeField,
    },
    /// The peer took fewer bytes than the full block
    ShortWrite {
        state: HandshakeState,
        expected: usize,
        written: usize,
    },
    /// Socket error, step timeout or cancellation
    Io { state: HandshakeState, source: io::Error },
}

impl HandshakeError {
    /// State the handshake was in when it failed
    pub fn state(&self) -> HandshakeState {
        match self {
            HandshakeError::PeerClosed { state }
            | HandshakeError::SizeMismatch { state, .. }
            | HandshakeError::FieldMismatch { state, .. }
            | HandshakeError::ShortWrite { state, .. }
            | HandshakeError::Io { state, .. } => *state,
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::PeerClosed { state } => write!(f, "peer closed connection in {}", state),
            HandshakeError::SizeMismatch { state, expected, actual } => write!(
                f,
                "expected {} bytes in {}, got {}",
                expected, state, actual
            ),
            HandshakeError::FieldMismatch { state, field } => {
                write!(f, "invalid {:?} in {}", field, state)
            }
            HandshakeError::ShortWrite { state, expected, written } => write!(
                f,
                "short write in {}: {} of {} bytes",
                state, written, expected
            ),
            HandshakeError::Io { state, source } => write!(f, "I/O error in {}: {}", state, source),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Per-connection handshake state; lives only as long as the handshake
#[derive(Debug)]
pub struct HandshakeContext {
    /// Our epoch, chosen once at VersionSent
    local_epoch: u32,
    /// Epoch from C1, echoed in S2
    peer_epoch: u32,
    /// Generated once at VersionSent, kept until checked against C2
    local_nonce: Vec<u8>,
    /// Random payload from C1, echoed in S2
    peer_nonce: Vec<u8>,
    state: HandshakeState,
}

impl HandshakeContext {
    fn new() -> Self {
        HandshakeContext {
            local_epoch: 0,
            peer_epoch: 0,
            local_nonce: Vec::new(),
            peer_nonce: Vec::new(),
            state: HandshakeState::Uninitialized,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn local_epoch(&self) -> u32 {
        self.local_epoch
    }

    pub fn local_nonce(&self) -> &[u8] {
        &self.local_nonce
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Drives the handshake over a transport
pub struct Handshake<T: Transport> {
    transport: T,
    info: ConnectionInfo,
    ctx: HandshakeContext,
    step_timeout: Option<Duration>,
    rng: SystemRandom,
}

impl<T: Transport> Handshake<T> {
    /// `step_timeout` bounds each read/write round; `None` waits forever.
    pub fn new(transport: T, info: ConnectionInfo, step_timeout: Option<Duration>) -> Self {
        Handshake {
            transport,
            info,
            ctx: HandshakeContext::new(),
            step_timeout,
            rng: SystemRandom::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.ctx.state
    }

    pub fn context(&self) -> &HandshakeContext {
        &self.ctx
    }

    /// Run every remaining step and hand out the authenticated connection.
    ///
    /// On failure the transport is dropped, closing the socket.
    pub fn run(mut self) -> Result<Connection<T>, HandshakeError> {
        while !self.ctx.state.is_terminal() {
            self.step()?;
        }
        if self.ctx.state == HandshakeState::Failed {
            return Err(HandshakeError::Io {
                state: HandshakeState::Failed,
                source: io::Error::new(io::ErrorKind::Other, "handshake already failed"),
            });
        }
        self.transport.set_deadline(None);
        log::info!("Handshake established with {} (conn={})", self.info.peer_addr, self.info.id);
        Ok(Connection::new(self.transport, self.info))
    }

    /// Execute one step: read, validate, write, advance.
    ///
    /// On a terminal state this does nothing and returns the state.
    pub fn step(&mut self) -> Result<HandshakeState, HandshakeError> {
        let from = self.ctx.state;
        let exchange: fn(&mut Self) -> Result<HandshakeState, HandshakeError> = match from {
            HandshakeState::Uninitialized => Self::exchange_version,
            HandshakeState::VersionSent => Self::exchange_random,
            HandshakeState::AckSent => Self::exchange_echo,
            HandshakeState::Established | HandshakeState::Failed => return Ok(from),
        };

        self.transport
            .set_deadline(self.step_timeout.map(|t| Instant::now() + t));
        let result = exchange(self);

        match result {
            Ok(next) => {
                log::debug!("Handshake {}: {} -> {}", self.info.peer_addr, from, next);
                self.ctx.state = next;
                Ok(next)
            }
            Err(e) => {
                log::debug!("Handshake {}: {} -> {}", self.info.peer_addr, from, HandshakeState::Failed);
                self.ctx.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    /// C0 → S0
    fn exchange_version(&mut self) -> Result<HandshakeState, HandshakeError> {
        let state = HandshakeState::Uninitialized;
        let c0 = self.read_block(state, 1)?;
        if c0[0] != PROTOCOL_VERSION {
            log::info!(
                "Unsupported handshake version {} from {}",
                c0[0],
                self.info.peer_addr
            );
            return Err(HandshakeError::FieldMismatch {
                state,
                field: HandshakeField::Version,
            });
        }
        self.write_block(state, &[PROTOCOL_VERSION])?;
        Ok(HandshakeState::VersionSent)
    }

    /// C1 → S1
    fn exchange_random(&mut self) -> Result<HandshakeState, HandshakeError> {
        let state = HandshakeState::VersionSent;
        let c1 = self.read_block(state, HANDSHAKE_PACKET_SIZE)?;

        // The peer must wait for S1 before sending C2, so anything already
        // queued belongs to an oversized C1.
        let extra = self
            .transport
            .pending()
            .map_err(|source| HandshakeError::Io { state, source })?;
        if extra > 0 {
            return Err(HandshakeError::SizeMismatch {
                state,
                expected: HANDSHAKE_PACKET_SIZE,
                actual: HANDSHAKE_PACKET_SIZE + extra,
            });
        }

        if read_u32(&c1[4..8]) != 0 {
            return Err(HandshakeError::FieldMismatch {
                state,
                field: HandshakeField::ZeroField,
            });
        }
        self.ctx.peer_epoch = read_u32(&c1[0..4]);
        self.ctx.peer_nonce = c1[8..].to_vec();

        self.ctx.local_epoch = current_epoch();
        let mut nonce = vec![0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce).map_err(|_| HandshakeError::Io {
            state,
            source: io::Error::new(io::ErrorKind::Other, "nonce generation failed"),
        })?;
        self.ctx.local_nonce = nonce;

        let s1 = build_packet(self.ctx.local_epoch, &self.ctx.local_nonce);
        self.write_block(state, &s1)?;
        Ok(HandshakeState::AckSent)
    }

    /// C2 → S2
    fn exchange_echo(&mut self) -> Result<HandshakeState, HandshakeError> {
        let state = HandshakeState::AckSent;
        let c2 = self.read_block(state, HANDSHAKE_PACKET_SIZE)?;

        if read_u32(&c2[0..4]) != self.ctx.local_epoch {
            return Err(HandshakeError::FieldMismatch {
                state,
                field: HandshakeField::EpochEcho,
            });
        }
        if c2[8..] != self.ctx.local_nonce[..] {
            return Err(HandshakeError::FieldMismatch {
                state,
                field: HandshakeField::NonceEcho,
            });
        }

        let s2 = build_packet(self.ctx.peer_epoch, &self.ctx.peer_nonce);
        self.write_block(state, &s2)?;
        Ok(HandshakeState::Established)
    }

    /// Read exactly `len` bytes
    fn read_block(&mut self, state: HandshakeState, len: usize) -> Result<Vec<u8>, HandshakeError> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self
                .transport
                .read(&mut buf[filled..])
                .map_err(|source| HandshakeError::Io { state, source })?;
            if n == 0 {
                return Err(if filled == 0 {
                    HandshakeError::PeerClosed { state }
                } else {
                    HandshakeError::SizeMismatch {
                        state,
                        expected: len,
                        actual: filled,
                    }
                });
            }
            filled += n;
        }
        Ok(buf)
    }

    fn write_block(&mut self, state: HandshakeState, block: &[u8]) -> Result<(), HandshakeError> {
        let written = self
            .transport
            .write(block)
            .map_err(|source| HandshakeError::Io { state, source })?;
        if written != block.len() {
            return Err(HandshakeError::ShortWrite {
                state,
                expected: block.len(),
                written,
            });
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(raw)
}

/// epoch(4) | zero(4) | payload(1528)
fn build_packet(epoch: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HANDSHAKE_PACKET_SIZE);
    packet.extend_from_slice(&epoch.to_be_bytes());
    packet.extend_from_slice(&[0u8; 4]);
    packet.extend_from_slice(payload);
    packet
}

/// Milliseconds since the Unix epoch, truncated to 32 bits
fn current_epoch() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::os::fd::RawFd;
    use std::sync::{Arc, Mutex};

    type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

    /// In-memory peer: serves queued bytes, records writes, and may react to
    /// each write by queueing more input. An empty queue reads as EOF.
    struct ScriptedPeer {
        shared: Arc<Mutex<Script>>,
    }

    struct Script {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        responder: Option<Responder>,
        write_limit: Option<usize>,
    }

    impl ScriptedPeer {
        fn new(inbound: Vec<u8>) -> (Self, Arc<Mutex<Script>>) {
            let shared = Arc::new(Mutex::new(Script {
                inbound: inbound.into(),
                outbound: Vec::new(),
                responder: None,
                write_limit: None,
            }));
            (ScriptedPeer { shared: Arc::clone(&shared) }, shared)
        }
    }

    impl Transport for ScriptedPeer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut script = self.shared.lock().unwrap();
            let n = buf.len().min(script.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = script.inbound.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut script = self.shared.lock().unwrap();
            let n = script.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
            script.outbound.extend_from_slice(&buf[..n]);
            if let Some(mut responder) = script.responder.take() {
                let reply = responder(&buf[..n]);
                script.inbound.extend(reply);
                script.responder = Some(responder);
            }
            Ok(n)
        }

        fn pending(&mut self) -> io::Result<usize> {
            Ok(self.shared.lock().unwrap().inbound.len())
        }

        fn set_deadline(&mut self, _deadline: Option<Instant>) {}

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn handle(&self) -> Option<RawFd> {
            None
        }
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            id: 1,
            peer_addr: "127.0.0.1:50000".parse().unwrap(),
            local_addr: "127.0.0.1:1935".parse().unwrap(),
            endpoint: 0,
        }
    }

    fn peer_c1() -> Vec<u8> {
        let random: Vec<u8> = (0..NONCE_SIZE).map(|i| (i * 7 % 251) as u8).collect();
        build_packet(0x0102_0304, &random)
    }

    /// C0 + C1, then echo S1 back as C2 (with `tamper` applied)
    fn echoing_peer(tamper: impl Fn(&mut Vec<u8>) + Send + 'static) -> (ScriptedPeer, Arc<Mutex<Script>>) {
        let mut inbound = vec![PROTOCOL_VERSION];
        inbound.extend(peer_c1());
        let (peer, shared) = ScriptedPeer::new(inbound);
        let mut answered = false;
        shared.lock().unwrap().responder = Some(Box::new(move |written: &[u8]| {
            // Only S1 gets an answer
            if answered || written.len() != HANDSHAKE_PACKET_SIZE {
                return Vec::new();
            }
            answered = true;
            let mut c2 = written.to_vec();
            // time2 is not validated
            c2[4..8].copy_from_slice(&[9, 9, 9, 9]);
            tamper(&mut c2);
            c2
        }));
        (peer, shared)
    }

    #[test]
    fn test_handshake_established() {
        let (peer, shared) = echoing_peer(|_| {});
        let mut handshake = Handshake::new(peer, info(), None);

        assert_eq!(handshake.step().unwrap(), HandshakeState::VersionSent);
        assert_eq!(handshake.step().unwrap(), HandshakeState::AckSent);
        assert_eq!(handshake.context().local_nonce().len(), NONCE_SIZE);
        assert_eq!(handshake.step().unwrap(), HandshakeState::Established);
        assert_eq!(handshake.step().unwrap(), HandshakeState::Established);

        let script = shared.lock().unwrap();
        let out = &script.outbound;
        // S0 + S1 + S2
        assert_eq!(out.len(), 1 + 2 * HANDSHAKE_PACKET_SIZE);
        assert_eq!(out[0], PROTOCOL_VERSION);
        let s1 = &out[1..1 + HANDSHAKE_PACKET_SIZE];
        assert_eq!(read_u32(&s1[0..4]), handshake.context().local_epoch());
        assert_eq!(&s1[4..8], &[0, 0, 0, 0]);
        assert_eq!(&s1[8..], handshake.context().local_nonce());
        let s2 = &out[1 + HANDSHAKE_PACKET_SIZE..];
        assert_eq!(s2, &peer_c1()[..]);
    }

    #[test]
    fn test_run_returns_connection() {
        let (peer, _shared) = echoing_peer(|_| {});
        let conn = Handshake::new(peer, info(), Some(Duration::from_secs(1))).run().unwrap();
        assert_eq!(conn.info(), &info());
    }

    #[test]
    fn test_nonce_bit_flip_rejected() {
        let (peer, shared) = echoing_peer(|c2| c2[8 + 700] ^= 0x10);
        let mut handshake = Handshake::new(peer, info(), None);
        handshake.step().unwrap();
        handshake.step().unwrap();

        let err = handshake.step().unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::FieldMismatch {
                state: HandshakeState::AckSent,
                field: HandshakeField::NonceEcho
            }
        ));
        assert_eq!(handshake.state(), HandshakeState::Failed);
        // No S2
        assert_eq!(shared.lock().unwrap().outbound.len(), 1 + HANDSHAKE_PACKET_SIZE);
    }

    #[test]
    fn test_last_nonce_bit_flip_rejected() {
        let (peer, _shared) = echoing_peer(|c2| c2[HANDSHAKE_PACKET_SIZE - 1] ^= 0x01);
        let err = Handshake::new(peer, info(), None).run().unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::FieldMismatch { field: HandshakeField::NonceEcho, .. }
        ));
    }

    #[test]
    fn test_epoch_echo_mismatch_rejected() {
        let (peer, _shared) = echoing_peer(|c2| c2[0] = c2[0].wrapping_add(1));
        let err = Handshake::new(peer, info(), None).run().unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::FieldMismatch { field: HandshakeField::EpochEcho, .. }
        ));
    }

    #[test]
    fn test_short_c1_is_size_mismatch() {
        let mut inbound = vec![PROTOCOL_VERSION];
        inbound.extend(vec![0u8; HANDSHAKE_PACKET_SIZE - 1]);
        let (peer, shared) = ScriptedPeer::new(inbound);
        let mut handshake = Handshake::new(peer, info(), None);
        handshake.step().unwrap();

        match handshake.step().unwrap_err() {
            HandshakeError::SizeMismatch { state, expected, actual } => {
                assert_eq!(state, HandshakeState::VersionSent);
                assert_eq!(expected, HANDSHAKE_PACKET_SIZE);
                assert_eq!(actual, HANDSHAKE_PACKET_SIZE - 1);
            }
            other => panic!("unexpected error: {}", other),
        }
        // Only S0, never S1
        assert_eq!(shared.lock().unwrap().outbound, vec![PROTOCOL_VERSION]);
    }

    #[test]
    fn test_long_c1_is_size_mismatch() {
        let mut inbound = vec![PROTOCOL_VERSION];
        inbound.extend(vec![0u8; HANDSHAKE_PACKET_SIZE + 1]);
        let (peer, shared) = ScriptedPeer::new(inbound);
        let err = Handshake::new(peer, info(), None).run().unwrap_err();

        assert!(matches!(
            err,
            HandshakeError::SizeMismatch {
                state: HandshakeState::VersionSent,
                actual,
                ..
            } if actual == HANDSHAKE_PACKET_SIZE + 1
        ));
        assert_eq!(shared.lock().unwrap().outbound, vec![PROTOCOL_VERSION]);
    }

    #[test]
    fn test_wrong_version_withholds_s0() {
        let mut inbound = vec![6u8];
        inbound.extend(peer_c1());
        let (peer, shared) = ScriptedPeer::new(inbound);
        let mut handshake = Handshake::new(peer, info(), None);

        let err = handshake.step().unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::FieldMismatch {
                state: HandshakeState::Uninitialized,
                field: HandshakeField::Version
            }
        ));
        assert_eq!(handshake.state(), HandshakeState::Failed);
        assert!(shared.lock().unwrap().outbound.is_empty());
        // Terminal: no further progress
        assert_eq!(handshake.step().unwrap(), HandshakeState::Failed);
    }

    #[test]
    fn test_nonzero_c1_field_rejected() {
        let mut c1 = peer_c1();
        c1[6] = 1;
        let mut inbound = vec![PROTOCOL_VERSION];
        inbound.extend(c1);
        let (peer, shared) = ScriptedPeer::new(inbound);
        let err = Handshake::new(peer, info(), None).run().unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::FieldMismatch { field: HandshakeField::ZeroField, .. }
        ));
        assert_eq!(shared.lock().unwrap().outbound.len(), 1);
    }

    #[test]
    fn test_peer_closed_at_each_state() {
        let (peer, _) = ScriptedPeer::new(Vec::new());
        let err = Handshake::new(peer, info(), None).run().unwrap_err();
        assert!(matches!(err, HandshakeError::PeerClosed { state: HandshakeState::Uninitialized }));

        let (peer, _) = ScriptedPeer::new(vec![PROTOCOL_VERSION]);
        let err = Handshake::new(peer, info(), None).run().unwrap_err();
        assert!(matches!(err, HandshakeError::PeerClosed { state: HandshakeState::VersionSent }));

        let mut inbound = vec![PROTOCOL_VERSION];
        inbound.extend(peer_c1());
        let (peer, _) = ScriptedPeer::new(inbound);
        let err = Handshake::new(peer, info(), None).run().unwrap_err();
        assert!(matches!(err, HandshakeError::PeerClosed { state: HandshakeState::AckSent }));
    }

    #[test]
    fn test_short_write_fails() {
        let (peer, shared) = echoing_peer(|_| {});
        shared.lock().unwrap().write_limit = Some(100);
        let mut handshake = Handshake::new(peer, info(), None);
        // S0 fits within the limit
        handshake.step().unwrap();
        match handshake.step().unwrap_err() {
            HandshakeError::ShortWrite { state, expected, written } => {
                assert_eq!(state, HandshakeState::VersionSent);
                assert_eq!(expected, HANDSHAKE_PACKET_SIZE);
                assert_eq!(written, 100);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_nonces_differ_between_handshakes() {
        let (peer_a, _) = echoing_peer(|_| {});
        let (peer_b, _) = echoing_peer(|_| {});
        let mut a = Handshake::new(peer_a, info(), None);
        let mut b = Handshake::new(peer_b, info(), None);
        for _ in 0..2 {
            a.step().unwrap();
            b.step().unwrap();
        }
        assert_ne!(a.context().local_nonce(), b.context().local_nonce());
    }

    #[test]
    fn test_error_display_names_state() {
        let err = HandshakeError::SizeMismatch {
            state: HandshakeState::VersionSent,
            expected: 1536,
            actual: 1535,
        };
        assert_eq!(err.to_string(), "expected 1536 bytes in VersionSent, got 1535");
        assert_eq!(err.state(), HandshakeState::VersionSent);
    }

    #[test]
    fn test_step_timeout_bounds_stalled_peer() {
        use crate::transport::{CancelToken, TcpTransport};
        use std::io::{Read, Write};
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let transport = TcpTransport::new(server, CancelToken::new()).unwrap();

        // C0 only, then nothing
        client.write_all(&[PROTOCOL_VERSION]).unwrap();
        let started = Instant::now();
        let err = Handshake::new(transport, info(), Some(Duration::from_millis(50)))
            .run()
            .unwrap_err();

        match err {
            HandshakeError::Io { state, ref source } => {
                assert_eq!(state, HandshakeState::VersionSent);
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        let mut s0 = [0u8; 1];
        client.read_exact(&mut s0).unwrap();
        assert_eq!(s0[0], PROTOCOL_VERSION);
    }
}
