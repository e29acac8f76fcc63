//! Local and remote peers

use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::PeerId;
use crate::pool::Pool;
use crate::transport::{ConnectionHandle, Transport};

use super::message::{IncomingMessage, OutgoingMessage};
use super::Backend;

/// This process: its identity, transport endpoint and message pools
pub struct LocalPeer {
    pub(crate) identity: PeerId,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) outgoing: Pool<OutgoingMessage>,
    pub(crate) incoming: Pool<IncomingMessage>,
    pub(crate) has_shutdown: bool,
}

impl LocalPeer {
    pub(crate) fn new(identity: PeerId, transport: Box<dyn Transport>) -> Self {
        LocalPeer {
            identity,
            transport,
            outgoing: Pool::new(),
            incoming: Pool::new(),
            has_shutdown: false,
        }
    }

    pub fn identity(&self) -> PeerId {
        self.identity
    }

    pub fn has_shutdown(&self) -> bool {
        self.has_shutdown
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn internal_addr(&self) -> SocketAddr {
        self.transport.internal_addr()
    }
}

/// A connected peer. Its addresses come from the hail and may differ from
/// what the transport sees because of NAT rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub identity: PeerId,
    pub internal: SocketAddr,
    pub external: SocketAddr,
    pub connection: ConnectionHandle,
}

/// Either kind of peer, borrowed from the backend. A remote peer carries
/// the local peer whose transport reaches it.
#[derive(Clone, Copy)]
pub enum Peer<'a> {
    Local(&'a LocalPeer),
    Remote(&'a RemotePeer, &'a LocalPeer),
}

impl Peer<'_> {
    pub fn identity(&self) -> PeerId {
        match self {
            Peer::Local(local) => local.identity,
            Peer::Remote(remote, _) => remote.identity,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Peer::Local(_))
    }

    /// Zero for the local peer; the transport's estimate for remote peers
    pub fn round_trip_time(&self) -> Option<Duration> {
        match self {
            Peer::Local(_) => Some(Duration::ZERO),
            Peer::Remote(remote, local) => local.transport.round_trip_time(remote.connection),
        }
    }
}

/// A peer borrowed mutably through its backend, for the operations that
/// change connection state
pub struct PeerMut<'a> {
    pub(crate) backend: &'a mut Backend,
    pub(crate) identity: PeerId,
}

impl PeerMut<'_> {
    pub fn identity(&self) -> PeerId {
        self.identity
    }

    pub fn is_local(&self) -> bool {
        self.identity == self.backend.local_identity()
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.backend.round_trip_time(self.identity)
    }

    /// Disconnecting the local peer shuts the whole backend down
    pub fn disconnect(self, reason: &str) {
        if self.is_local() {
            self.backend.shutdown(reason);
        } else {
            self.backend.disconnect_peer(self.identity, reason);
        }
    }
}
