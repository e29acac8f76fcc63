//! Hail payloads exchanged during the connection handshake
//!
//! # Protocol Flow
//!
//! ```text
//! Client                                     Host
//!   │── connect(ClientHail) ──────────────────►│  ConnectionApproval
//!   │                                          │  (listener authorizes identity)
//!   │◄─────────────────── approve(HostHail) ───│
//!   │  Connected(HostHail)        Connected(ClientHail)
//! ```
//!
//! Both hails start with the same three fields (identity, internal address,
//! external address) so the connected side can build a remote peer from
//! either one. The client hail appends the host's external address, which
//! the host cannot observe itself and only learns from the mediator.

use std::net::SocketAddr;

use crate::identity::PeerId;
use crate::wire::{WireError, WireReader, WireWriter};

/// Hail sent by the connecting side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHail {
    pub identity: PeerId,
    pub internal: SocketAddr,
    /// Client address as observed by the mediator
    pub external: SocketAddr,
    /// Host address as observed by the mediator
    pub host_external: SocketAddr,
}

impl ClientHail {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(64);
        let mut w = WireWriter::new(&mut buf);
        w.write_peer_id(&self.identity)?;
        w.write_addr(&self.internal);
        w.write_addr(&self.external);
        w.write_addr(&self.host_external);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(data);
        Ok(ClientHail {
            identity: r.read_peer_id()?,
            internal: r.read_addr()?,
            external: r.read_addr()?,
            host_external: r.read_addr()?,
        })
    }
}

/// Hail returned by the approving side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostHail {
    pub identity: PeerId,
    pub internal: SocketAddr,
    /// Host address as observed by the mediator, echoed from the client hail
    pub external: SocketAddr,
}

impl HostHail {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(48);
        let mut w = WireWriter::new(&mut buf);
        w.write_peer_id(&self.identity)?;
        w.write_addr(&self.internal);
        w.write_addr(&self.external);
        Ok(buf)
    }
}

/// The common prefix of both hail kinds, read once a connection is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteHail {
    pub identity: PeerId,
    pub internal: SocketAddr,
    pub external: SocketAddr,
}

impl RemoteHail {
    /// Trailing fields (the client's host address) are ignored
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(data);
        Ok(RemoteHail {
            identity: r.read_peer_id()?,
            internal: r.read_addr()?,
            external: r.read_addr()?,
        })
    }
}
