//! Transport-independent peer identity
//!
//! Every local endpoint draws a fresh 128-bit random identity at startup.
//! The identity survives NAT remapping and reconnection, so it (and never a
//! socket address) is what the session layer uses to name a peer.
//!
//! # String form
//!
//! ```text
//! 3fae1c2d-0b7e-4a51-9c3e-5f20d8a1b6c4
//! └─8 hex─┘ └4┘ └4┘ └4┘ └───12 hex───┘
//! ```

use std::fmt;
use std::str::FromStr;

use ring::rand::{SecureRandom, SystemRandom};

/// Length of a peer identity in bytes
pub const PEER_ID_LEN: usize = 16;

/// Byte offsets where the string form inserts a hyphen
const GROUP_ENDS: [usize; 4] = [4, 6, 8, 10];

/// Globally unique logical address of a peer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Draw a new random identity from the system RNG
    pub fn generate() -> Result<Self, ring::error::Unspecified> {
        let mut bytes = [0u8; PEER_ID_LEN];
        SystemRandom::new().fill(&mut bytes)?;
        Ok(PeerId(bytes))
    }

    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Parse the hyphenated string form. Returns `None` on any deviation.
    pub fn parse(input: &str) -> Option<Self> {
        let mut bytes = [0u8; PEER_ID_LEN];
        let mut digits = input.chars().filter(|c| *c != '-');

        if input.len() != PEER_ID_LEN * 2 + GROUP_ENDS.len() {
            return None;
        }

        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = digits.next()?.to_digit(16)?;
            let lo = digits.next()?.to_digit(16)?;
            *byte = (hi << 4 | lo) as u8;

            // Hyphens must sit exactly at the group boundaries
            if GROUP_ENDS.contains(&(i + 1)) {
                let offset = (i + 1) * 2 + GROUP_ENDS.iter().position(|e| *e == i + 1)?;
                if input.as_bytes().get(offset) != Some(&b'-') {
                    return None;
                }
            }
        }

        Some(PeerId(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if GROUP_ENDS.contains(&i) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Error returned by `PeerId::from_str`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid peer identity '{0}'")]
pub struct InvalidPeerId(pub String);

impl FromStr for PeerId {
    type Err = InvalidPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerId::parse(s).ok_or_else(|| InvalidPeerId(s.to_string()))
    }
}
