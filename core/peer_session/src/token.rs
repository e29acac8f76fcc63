//! NAT introduction token
//!
//! Whoever mediates an introduction (the registry for internet sessions, the
//! session host for mesh joins) packs the host identity and both externally
//! observed addresses into a token. The transport hands it back to the
//! client together with the punched address once hole punching succeeds.
//!
//! # Format
//!
//! ```text
//! <host identity>;<host ext address>;<host ext port>;<client ext address>;<client ext port>
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::identity::PeerId;

/// Field separator of the serialized form
const SEPARATOR: char = ';';

/// Number of fields in the serialized form
const FIELD_COUNT: usize = 5;

/// Addresses and identity carried through a NAT introduction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntroductionToken {
    /// Identity of the host being joined
    pub host: PeerId,
    /// Host address as observed by the mediator
    pub host_external: SocketAddr,
    /// Client address as observed by the mediator
    pub client_external: SocketAddr,
}

impl IntroductionToken {
    pub fn new(host: PeerId, host_external: SocketAddr, client_external: SocketAddr) -> Self {
        IntroductionToken {
            host,
            host_external,
            client_external,
        }
    }

    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Parse a serialized token. Any field count mismatch or unparsable
    /// field yields `None`, never a partial token.
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split(SEPARATOR).collect();
        if parts.len() != FIELD_COUNT {
            return None;
        }

        let host = PeerId::parse(parts[0])?;
        let host_ip: IpAddr = parts[1].parse().ok()?;
        let host_port: u16 = parts[2].parse().ok()?;
        let client_ip: IpAddr = parts[3].parse().ok()?;
        let client_port: u16 = parts[4].parse().ok()?;

        Some(IntroductionToken {
            host,
            host_external: SocketAddr::new(host_ip, host_port),
            client_external: SocketAddr::new(client_ip, client_port),
        })
    }
}

impl fmt::Display for IntroductionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}{sep}{}",
            self.host,
            self.host_external.ip(),
            self.host_external.port(),
            self.client_external.ip(),
            self.client_external.port(),
            sep = SEPARATOR
        )
    }
}
