//! Connectionless control packets sharing the UDP socket with QUIC
//!
//! Every QUIC packet has the fixed bit (0x40) set in its first byte. Control
//! packets use a type byte below 0x40, so a single byte decides which path
//! an incoming datagram takes.
//!
//! ```text
//! 0x01 DiscoveryRequest   app id (string)
//! 0x02 DiscoveryResponse  payload (rest of packet)
//! 0x03 Unconnected        payload (rest of packet)
//! 0x04 NatIntroduction    is_host (bool), target internal, target external, token (string)
//! 0x05 NatPunch           from_host (bool), token (string)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::wire::{WireError, WireReader, WireWriter};

const TYPE_DISCOVERY_REQUEST: u8 = 0x01;
const TYPE_DISCOVERY_RESPONSE: u8 = 0x02;
const TYPE_UNCONNECTED: u8 = 0x03;
const TYPE_NAT_INTRODUCTION: u8 = 0x04;
const TYPE_NAT_PUNCH: u8 = 0x05;

/// QUIC fixed bit, set on every long and short header packet
const QUIC_FIXED_BIT: u8 = 0x40;

/// True when the datagram is a control packet rather than QUIC
pub fn is_control_packet(data: &[u8]) -> bool {
    matches!(data.first(), Some(first) if first & QUIC_FIXED_BIT == 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    DiscoveryRequest {
        app_id: String,
    },
    DiscoveryResponse {
        payload: Vec<u8>,
    },
    Unconnected {
        payload: Vec<u8>,
    },
    /// Sent by a mediator to each side of an introduction
    NatIntroduction {
        is_host: bool,
        target_internal: SocketAddr,
        target_external: SocketAddr,
        token: String,
    },
    NatPunch {
        from_host: bool,
        token: String,
    },
}

impl ControlPacket {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        let mut w = WireWriter::new(&mut buf);
        match self {
            ControlPacket::DiscoveryRequest { app_id } => {
                w.write_u8(TYPE_DISCOVERY_REQUEST);
                w.write_str(app_id)?;
            }
            ControlPacket::DiscoveryResponse { payload } => {
                w.write_u8(TYPE_DISCOVERY_RESPONSE);
                w.write_raw(payload);
            }
            ControlPacket::Unconnected { payload } => {
                w.write_u8(TYPE_UNCONNECTED);
                w.write_raw(payload);
            }
            ControlPacket::NatIntroduction {
                is_host,
                target_internal,
                target_external,
                token,
            } => {
                w.write_u8(TYPE_NAT_INTRODUCTION);
                w.write_bool(*is_host);
                w.write_addr(target_internal);
                w.write_addr(target_external);
                w.write_str(token)?;
            }
            ControlPacket::NatPunch { from_host, token } => {
                w.write_u8(TYPE_NAT_PUNCH);
                w.write_bool(*from_host);
                w.write_str(token)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(data);
        let packet = match r.read_u8()? {
            TYPE_DISCOVERY_REQUEST => ControlPacket::DiscoveryRequest { app_id: r.read_str()? },
            TYPE_DISCOVERY_RESPONSE => ControlPacket::DiscoveryResponse {
                payload: r.read_rest().to_vec(),
            },
            TYPE_UNCONNECTED => ControlPacket::Unconnected {
                payload: r.read_rest().to_vec(),
            },
            TYPE_NAT_INTRODUCTION => ControlPacket::NatIntroduction {
                is_host: r.read_bool()?,
                target_internal: r.read_addr()?,
                target_external: r.read_addr()?,
                token: r.read_str()?,
            },
            TYPE_NAT_PUNCH => ControlPacket::NatPunch {
                from_host: r.read_bool()?,
                token: r.read_str()?,
            },
            other => {
                return Err(WireError::InvalidValue {
                    field: "control packet type",
                    value: other,
                })
            }
        };
        Ok(packet)
    }
}

/// How long a punch token stays reported. Punches toward the internal and
/// external address of one introduction land well inside this.
pub const PUNCH_TOKEN_WINDOW: Duration = Duration::from_secs(5);

/// Tokens already reported as `NatIntroductionSuccess`, forgotten after
/// [`PUNCH_TOKEN_WINDOW`] so a later introduction with the same token is
/// reported again
#[derive(Debug, Default)]
pub struct PunchTokens {
    seen: HashMap<String, Instant>,
}

impl PunchTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `token` shows up inside the window
    pub fn first_report(&mut self, token: &str, now: Instant) -> bool {
        match self.seen.get(token) {
            Some(&at) if now.saturating_duration_since(at) < PUNCH_TOKEN_WINDOW => false,
            _ => {
                self.seen.insert(token.to_string(), now);
                true
            }
        }
    }

    /// Forget tokens reported longer than a window ago
    pub fn trim(&mut self, now: Instant) {
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < PUNCH_TOKEN_WINDOW);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_punch_token_reported_once_per_window() {
        let mut tokens = PunchTokens::new();
        let start = Instant::now();

        assert!(tokens.first_report("a", start));
        assert!(!tokens.first_report("a", start + Duration::from_millis(10)));
        assert!(tokens.first_report("b", start));
        assert!(tokens.first_report("a", start + PUNCH_TOKEN_WINDOW));
    }

    #[test]
    fn test_punch_tokens_trimmed_after_window() {
        let mut tokens = PunchTokens::new();
        let start = Instant::now();
        tokens.first_report("old", start);
        tokens.first_report("new", start + Duration::from_secs(3));

        tokens.trim(start + PUNCH_TOKEN_WINDOW);
        assert_eq!(tokens.len(), 1);
        tokens.trim(start + Duration::from_secs(3) + PUNCH_TOKEN_WINDOW);
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_control_packets_never_look_like_quic() {
        let packets = [
            ControlPacket::DiscoveryRequest {
                app_id: "tanks".into(),
            },
            ControlPacket::DiscoveryResponse { payload: vec![0xFF] },
            ControlPacket::Unconnected { payload: vec![] },
            ControlPacket::NatIntroduction {
                is_host: true,
                target_internal: "10.0.0.2:3074".parse().unwrap(),
                target_external: "203.0.113.5:7777".parse().unwrap(),
                token: "t".into(),
            },
            ControlPacket::NatPunch {
                from_host: false,
                token: "t".into(),
            },
        ];
        for packet in packets {
            let encoded = packet.encode().unwrap();
            assert!(is_control_packet(&encoded));
            assert_eq!(ControlPacket::decode(&encoded).unwrap(), packet);
        }
    }

    #[test]
    fn test_quic_headers_are_not_control() {
        // Long header Initial and a short header packet
        assert!(!is_control_packet(&[0xC3, 0, 0, 0, 1]));
        assert!(!is_control_packet(&[0x41, 0xAA]));
        assert!(!is_control_packet(&[]));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert_eq!(
            ControlPacket::decode(&[0x3F]),
            Err(WireError::InvalidValue {
                field: "control packet type",
                value: 0x3F
            })
        );
    }
}
