//! Transport abstraction
//!
//! The backend drives a connection-oriented datagram transport through the
//! [`Transport`] trait and consumes what it observes as [`TransportEvent`]s.
//! Two implementations exist:
//!
//! - [`QuicTransport`]: quiche connections over a single mio UDP socket,
//!   sharing the socket with connectionless control packets (discovery,
//!   unconnected data, NAT introduction and punching).
//! - [`LoopbackTransport`]: endpoints on an in-memory [`LoopbackNetwork`],
//!   with the same event semantics, for tests and same-process sessions.
//!
//! # Connection lifecycle
//!
//! ```text
//! Client                                       Host
//!   │ connect(addr, hail)                        │
//!   │───────────── handshake + hail ────────────►│ ConnectionApproval { hail }
//!   │                                            │ approve(conn, reply) / deny(conn, reason)
//!   │◄──────────────────── reply ────────────────│ StatusChanged(Connected { client hail })
//!   │ StatusChanged(Connected { reply })         │
//!   │◄──────────────── Data / Data ─────────────►│
//!   │ StatusChanged(Disconnected)                │ StatusChanged(Disconnected)
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use ring::rand::SecureRandom;

pub mod control;
mod interface;
pub mod loopback;
pub mod quic;

pub use interface::first_interface_address;
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use quic::{QuicConfig, QuicTransport};

/// Opaque per-transport connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Delivery guarantee requested for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// May be lost; late arrivals older than the newest seen are dropped
    UnreliableSequenced,
    ReliableUnordered,
    /// Ordered within its channel
    ReliableOrdered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Handshake and approval completed; carries the far side's hail
    Connected { remote_hail: Vec<u8> },
    Disconnected,
}

/// Everything a transport reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DiscoveryRequest {
        from: SocketAddr,
    },
    DiscoveryResponse {
        from: SocketAddr,
        payload: Vec<u8>,
    },
    UnconnectedData {
        from: SocketAddr,
        payload: Vec<u8>,
    },
    /// Hole punching toward an introduced host succeeded
    NatIntroductionSuccess {
        from: SocketAddr,
        token: String,
    },
    /// A client completed its handshake and waits for approve/deny
    ConnectionApproval {
        connection: ConnectionHandle,
        hail: Vec<u8>,
    },
    StatusChanged {
        connection: ConnectionHandle,
        status: ConnectionStatus,
        reason: String,
    },
    Data {
        connection: ConnectionHandle,
        payload: Vec<u8>,
    },
    /// Transport-internal diagnostics, forwarded to the log
    Diagnostic {
        level: log::Level,
        message: String,
    },
}

/// Byte and packet counters since the transport started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

/// Artificial network conditions for testing games under bad links
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimulatedConditions {
    /// Upper bound of the random delay added to each connected send
    pub latency: Duration,
    /// Chance in `0.0..=1.0` that an unreliable message is dropped
    pub loss: f32,
}

impl SimulatedConditions {
    pub fn is_ideal(&self) -> bool {
        self.latency.is_zero() && self.loss <= 0.0
    }

    /// Roll for one unreliable message
    pub fn drops(&self, rng: &dyn SecureRandom) -> bool {
        if self.loss <= 0.0 {
            return false;
        }
        if self.loss >= 1.0 {
            return true;
        }
        unit_interval(rng) < f64::from(self.loss)
    }

    /// Delay for one send, uniform in `0..=latency`
    pub fn delay(&self, rng: &dyn SecureRandom) -> Duration {
        if self.latency.is_zero() {
            return Duration::ZERO;
        }
        self.latency.mul_f64(unit_interval(rng))
    }
}

/// Uniform in `[0, 1)`; zero if the system source fails
fn unit_interval(rng: &dyn SecureRandom) -> f64 {
    let mut bytes = [0u8; 4];
    if rng.fill(&mut bytes).is_err() {
        return 0.0;
    }
    f64::from(u32::from_be_bytes(bytes)) / (f64::from(u32::MAX) + 1.0)
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("QUIC error: {0}")]
    Quic(#[from] quiche::Error),
    #[error("invalid transport configuration: {0}")]
    Config(String),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionHandle),
    #[error("connection {0} is not connected")]
    NotConnected(ConnectionHandle),
    #[error("failed to encode packet: {0}")]
    Encode(#[from] crate::wire::WireError),
    #[error("failed to generate random connection id")]
    Random,
    #[error("transport has shut down")]
    ShutDown,
}

/// Connection-oriented datagram transport with connectionless side channels
pub trait Transport: Send {
    /// Address the transport is bound to
    fn local_addr(&self) -> SocketAddr;

    /// Address other hosts on the local network can reach us at
    fn internal_addr(&self) -> SocketAddr;

    /// Whether other peers can connect to this endpoint
    fn accepts_incoming(&self) -> bool;

    /// Perform pending I/O, waiting at most `timeout` for traffic. A zero
    /// timeout never blocks.
    fn pump(&mut self, timeout: Option<Duration>) -> Result<(), TransportError>;

    /// Next event observed by `pump`, oldest first
    fn next_event(&mut self) -> Option<TransportEvent>;

    /// Start a connection carrying `hail` for the far side's approval
    fn connect(&mut self, addr: SocketAddr, hail: &[u8]) -> Result<ConnectionHandle, TransportError>;

    /// Live or in-progress connection to `addr`, if any
    fn connection_to(&self, addr: SocketAddr) -> Option<ConnectionHandle>;

    fn approve(&mut self, connection: ConnectionHandle, hail: &[u8]) -> Result<(), TransportError>;

    fn deny(&mut self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError>;

    fn send(
        &mut self,
        connection: ConnectionHandle,
        payload: &[u8],
        reliability: Reliability,
        channel: u8,
    ) -> Result<(), TransportError>;

    fn disconnect(&mut self, connection: ConnectionHandle, reason: &str);

    fn send_unconnected(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError>;

    /// Send a discovery request; a broadcast address reaches every endpoint
    /// listening on that port
    fn discover(&mut self, addr: SocketAddr) -> Result<(), TransportError>;

    fn send_discovery_response(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError>;

    /// Ask both sides to punch toward each other. The client side reports
    /// `NatIntroductionSuccess` with `token` once the host is reachable.
    fn introduce(
        &mut self,
        host_internal: SocketAddr,
        host_external: SocketAddr,
        client_internal: SocketAddr,
        client_external: SocketAddr,
        token: &str,
    ) -> Result<(), TransportError>;

    fn round_trip_time(&self, connection: ConnectionHandle) -> Option<Duration>;

    fn statistics(&self) -> TransportStats;

    /// Apply artificial latency and loss to later sends
    fn set_simulated_conditions(&mut self, conditions: SimulatedConditions);

    /// Close every connection and release the endpoint. Idempotent.
    fn shutdown(&mut self, reason: &str);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn local_addr(&self) -> SocketAddr {
        (**self).local_addr()
    }

    fn internal_addr(&self) -> SocketAddr {
        (**self).internal_addr()
    }

    fn accepts_incoming(&self) -> bool {
        (**self).accepts_incoming()
    }

    fn pump(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        (**self).pump(timeout)
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        (**self).next_event()
    }

    fn connect(&mut self, addr: SocketAddr, hail: &[u8]) -> Result<ConnectionHandle, TransportError> {
        (**self).connect(addr, hail)
    }

    fn connection_to(&self, addr: SocketAddr) -> Option<ConnectionHandle> {
        (**self).connection_to(addr)
    }

    fn approve(&mut self, connection: ConnectionHandle, hail: &[u8]) -> Result<(), TransportError> {
        (**self).approve(connection, hail)
    }

    fn deny(&mut self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError> {
        (**self).deny(connection, reason)
    }

    fn send(
        &mut self,
        connection: ConnectionHandle,
        payload: &[u8],
        reliability: Reliability,
        channel: u8,
    ) -> Result<(), TransportError> {
        (**self).send(connection, payload, reliability, channel)
    }

    fn disconnect(&mut self, connection: ConnectionHandle, reason: &str) {
        (**self).disconnect(connection, reason)
    }

    fn send_unconnected(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        (**self).send_unconnected(addr, payload)
    }

    fn discover(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        (**self).discover(addr)
    }

    fn send_discovery_response(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        (**self).send_discovery_response(addr, payload)
    }

    fn introduce(
        &mut self,
        host_internal: SocketAddr,
        host_external: SocketAddr,
        client_internal: SocketAddr,
        client_external: SocketAddr,
        token: &str,
    ) -> Result<(), TransportError> {
        (**self).introduce(host_internal, host_external, client_internal, client_external, token)
    }

    fn round_trip_time(&self, connection: ConnectionHandle) -> Option<Duration> {
        (**self).round_trip_time(connection)
    }

    fn statistics(&self) -> TransportStats {
        (**self).statistics()
    }

    fn set_simulated_conditions(&mut self, conditions: SimulatedConditions) {
        (**self).set_simulated_conditions(conditions)
    }

    fn shutdown(&mut self, reason: &str) {
        (**self).shutdown(reason)
    }
}
