//! Master server (rendezvous registry) protocol
//!
//! All registry traffic is unconnected datagrams. Requests start with the
//! application id so the registry can drop traffic from other games, then a
//! one-byte message type:
//!
//! ```text
//! app id (string) | type (u8) | fields
//!
//! 0 RegisterHost          identity, internal address, public info (bytes)
//! 1 UnregisterHost        identity
//! 2 RequestHosts          -
//! 3 RequestIntroduction   host identity, client internal address
//! ```
//!
//! The registry answers `RequestHosts` with one datagram per host holding a
//! [`HostListing`], the same shape a host sends in reply to LAN discovery.

use std::net::SocketAddr;

use crate::identity::PeerId;
use crate::wire::{WireError, WireReader, WireWriter};

const TYPE_REGISTER_HOST: u8 = 0;
const TYPE_UNREGISTER_HOST: u8 = 1;
const TYPE_REQUEST_HOSTS: u8 = 2;
const TYPE_REQUEST_INTRODUCTION: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MasterProtocolError {
    #[error("application id mismatch: expected '{expected}', received '{received}'")]
    AppIdMismatch { expected: String, received: String },
    #[error("unknown master message type {0}")]
    UnknownMessageType(u8),
    #[error("malformed master message: {0}")]
    Malformed(#[from] WireError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterMessage {
    RegisterHost {
        identity: PeerId,
        internal: SocketAddr,
        public_info: Vec<u8>,
    },
    UnregisterHost {
        identity: PeerId,
    },
    RequestHosts,
    RequestIntroduction {
        host: PeerId,
        client_internal: SocketAddr,
    },
}

impl MasterMessage {
    pub fn encode(&self, app_id: &str) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(64);
        let mut w = WireWriter::new(&mut buf);
        w.write_str(app_id)?;

        match self {
            MasterMessage::RegisterHost {
                identity,
                internal,
                public_info,
            } => {
                w.write_u8(TYPE_REGISTER_HOST);
                w.write_peer_id(identity)?;
                w.write_addr(internal);
                w.write_bytes(public_info);
            }
            MasterMessage::UnregisterHost { identity } => {
                w.write_u8(TYPE_UNREGISTER_HOST);
                w.write_peer_id(identity)?;
            }
            MasterMessage::RequestHosts => {
                w.write_u8(TYPE_REQUEST_HOSTS);
            }
            MasterMessage::RequestIntroduction { host, client_internal } => {
                w.write_u8(TYPE_REQUEST_INTRODUCTION);
                w.write_peer_id(host)?;
                w.write_addr(client_internal);
            }
        }
        Ok(buf)
    }

    /// Decode a request, rejecting any other application's traffic
    pub fn decode(data: &[u8], expected_app_id: &str) -> Result<Self, MasterProtocolError> {
        let mut r = WireReader::new(data);

        let app_id = r.read_str()?;
        if app_id != expected_app_id {
            return Err(MasterProtocolError::AppIdMismatch {
                expected: expected_app_id.to_string(),
                received: app_id,
            });
        }

        let message = match r.read_u8()? {
            TYPE_REGISTER_HOST => MasterMessage::RegisterHost {
                identity: r.read_peer_id()?,
                internal: r.read_addr()?,
                public_info: r.read_bytes()?,
            },
            TYPE_UNREGISTER_HOST => MasterMessage::UnregisterHost {
                identity: r.read_peer_id()?,
            },
            TYPE_REQUEST_HOSTS => MasterMessage::RequestHosts,
            TYPE_REQUEST_INTRODUCTION => MasterMessage::RequestIntroduction {
                host: r.read_peer_id()?,
                client_internal: r.read_addr()?,
            },
            other => return Err(MasterProtocolError::UnknownMessageType(other)),
        };
        Ok(message)
    }
}

/// A host as advertised to searching clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostListing {
    pub identity: PeerId,
    /// Game-defined session description, opaque here
    pub public_info: Vec<u8>,
}

impl HostListing {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(48 + self.public_info.len());
        let mut w = WireWriter::new(&mut buf);
        w.write_peer_id(&self.identity)?;
        w.write_bytes(&self.public_info);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(data);
        Ok(HostListing {
            identity: r.read_peer_id()?,
            public_info: r.read_bytes()?,
        })
    }
}
