//! Peer Session Core
//!
//! This crate provides the networking core for peer-to-peer game sessions:
//! - Stable peer identities independent of NAT-rewritten addresses
//! - A transport abstraction with QUIC (quiche + mio) and in-memory loopback
//! - The peer backend: connection approval, hail exchange, message pools
//! - NAT introduction through a mediator (another peer or the master server)
//! - Blocking host discovery on the LAN or through the master server
//! - The internal message catalog that keeps session state in sync
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────────────── NetworkSession ────────────────────────────┐
//!   │                                                                        │
//!   │   SessionState ◄── receivers ◄── Dispatcher ◄── receive_message        │
//!   │        │                                             ▲                 │
//!   │        └── senders ──► Outbox ── flush ──┐           │ SessionListener │
//!   │                                          ▼           │                 │
//!   │                                       Backend ───────┘                 │
//!   │                                          │                             │
//!   └──────────────────────────────────────────┼─────────────────────────────┘
//!                                              ▼
//!                               Transport (QuicTransport / LoopbackTransport)
//!                                              │
//!                          UDP ◄───────────────┴──────────► master server
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod backend;
pub mod discovery;
pub mod hail;
pub mod identity;
pub mod master;
pub mod messages;
pub mod pool;
pub mod session;
pub mod settings;
pub mod token;
pub mod transport;
pub mod wire;

// ============================================================================
// Re-exports
// ============================================================================

pub use backend::{Backend, BackendError, Peer, PeerMut, Recipient, RemotePeer, SessionListener};
pub use discovery::{find_hosts, AvailableHost, DiscoveryTarget, HostRoute};
pub use identity::PeerId;
pub use master::{HostListing, MasterMessage, MasterProtocolError};
pub use messages::{Dispatcher, MessageCatalog, MessageKind, SendDataOptions};
pub use session::{
    NetworkSession, PendingGamer, SessionError, SessionEvent, SessionKind, SessionProperties, SessionSearch,
    SessionSettings,
};
pub use settings::NetworkSettings;
pub use token::IntroductionToken;
pub use transport::{
    LoopbackNetwork, LoopbackTransport, QuicConfig, QuicTransport, Reliability, SimulatedConditions, Transport,
    TransportError, TransportEvent,
};
