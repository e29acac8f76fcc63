//! Byte-level encoding shared by every payload this crate puts on the wire
//!
//! Hail payloads, registry datagrams and internal messages are all flat
//! field sequences. Decoding is driven purely by what was encoded: there is
//! no schema, so writer and reader calls must mirror each other exactly.
//!
//! # Field encodings
//!
//! ```text
//! bool     1 byte (0 / 1)
//! u8       1 byte
//! i32/u32  4 bytes, big-endian
//! string   u16 length (big-endian) + UTF-8 bytes
//! bytes    u32 length (big-endian) + raw bytes
//! address  family (4 or 6) + 4/16 address bytes + u16 port (big-endian)
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::identity::PeerId;

/// Errors raised while decoding wire data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("unknown address family {0}")]
    InvalidAddressFamily(u8),
    #[error("invalid peer identity '{0}'")]
    InvalidIdentity(String),
    #[error("string field too long ({0} bytes)")]
    StringTooLong(usize),
    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u8 },
}

// ============================================================================
// Writer
// ============================================================================

/// Appends fields to a byte buffer
#[derive(Debug)]
pub struct WireWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        WireWriter { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a length-prefixed string. Strings longer than `u16::MAX` bytes
    /// are a caller bug and rejected.
    pub fn write_str(&mut self, value: &str) -> Result<(), WireError> {
        let len = u16::try_from(value.len()).map_err(|_| WireError::StringTooLong(value.len()))?;
        self.write_u16(len);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    /// Write raw bytes with no length prefix
    pub fn write_raw(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    pub fn write_addr(&mut self, addr: &SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.write_u8(4);
                self.buf.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.write_u8(6);
                self.buf.extend_from_slice(&ip.octets());
            }
        }
        self.write_u16(addr.port());
    }

    /// Identities travel in their string form, as the registry protocol and
    /// hail payloads expect.
    pub fn write_peer_id(&mut self, id: &PeerId) -> Result<(), WireError> {
        self.write_str(&id.to_string())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Reads fields from a byte slice, tracking position
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        WireReader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < needed {
            return Err(WireError::Truncated {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_str(&mut self) -> Result<String, WireError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read everything left in the buffer
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn read_addr(&mut self) -> Result<SocketAddr, WireError> {
        let ip = match self.read_u8()? {
            4 => {
                let b = self.take(4)?;
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16)?);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(WireError::InvalidAddressFamily(other)),
        };
        let port = self.read_u16()?;
        Ok(SocketAddr::new(ip, port))
    }

    pub fn read_peer_id(&mut self) -> Result<PeerId, WireError> {
        let text = self.read_str()?;
        PeerId::parse(&text).ok_or(WireError::InvalidIdentity(text))
    }
}
