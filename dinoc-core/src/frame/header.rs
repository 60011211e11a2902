//! The self-describing frame header.
//!
//! ```text
//!  0       1       2       3       4..7        8..N
//! +-------+-------+-------+-------+-----------+--------+
//! | magic |  ver  | flags |  kind |  length   |  body  |
//! +-------+-------+-------+-------+-----------+--------+
//! ```
//!
//! `magic` simultaneously signals which AEAD family sealed the body, or that
//! the body is still plaintext during the registration handshake. `length`
//! is the big-endian byte count of `body`.

use crate::error::{Error, Result};

/// Total size of a [`FrameHeader`] on the wire.
pub const FRAME_HEADER_LEN: usize = 8;

/// Body is plaintext; only valid before a session key has been installed
/// (i.e. the registration handshake).
pub const MAGIC_PLAINTEXT: u8 = 0x00;
/// Body is sealed with AES-256-GCM.
pub const MAGIC_AES_GCM: u8 = 0xA3;
/// Body is sealed with ChaCha20-Poly1305.
pub const MAGIC_CHACHA20_POLY1305: u8 = 0xC2;

/// The wire protocol version this build speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Bit 0 of [`FrameHeader::flags`]: the body was RLE-compressed before
/// encryption. Only meaningful for transports that carry a frame as a
/// single unit (TCP, WS); datagram transports carry the compressed bit on
/// each [`super::fragment::FragmentHeader`] instead.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// A coarse hint about what a frame carries, used for routing and logging.
/// Heartbeats are *not* a `FrameKind` — per the design they are identified
/// structurally, by a 4-byte plaintext body of `"HEAR"` once decrypted, so
/// that an observer on the wire (without the session key) cannot
/// distinguish a heartbeat from any other short message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Application = 0,
    Registration = 1,
    RegistrationReply = 2,
    TaskResult = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Application),
            1 => Ok(FrameKind::Registration),
            2 => Ok(FrameKind::RegistrationReply),
            3 => Ok(FrameKind::TaskResult),
            other => Err(Error::protocol(format!("unknown frame kind {other}"))),
        }
    }
}

/// A parsed frame header. `length` describes the size of the body that
/// follows it on the wire; it is not validated against the actual amount of
/// data available until the caller reads that many bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u8,
    pub version: u8,
    pub flags: u8,
    pub kind: FrameKind,
    pub length: u32,
}

impl FrameHeader {
    pub fn new(magic: u8, kind: FrameKind, length: u32) -> Self {
        Self {
            magic,
            version: PROTOCOL_VERSION,
            flags: 0,
            kind,
            length,
        }
    }

    pub fn compressed(mut self) -> Self {
        self.flags |= FLAG_COMPRESSED;
        self
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn is_plaintext(&self) -> bool {
        self.magic == MAGIC_PLAINTEXT
    }

    /// Serializes the header to its 8-byte wire form.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut bytes = [0u8; FRAME_HEADER_LEN];
        bytes[0] = self.magic;
        bytes[1] = self.version;
        bytes[2] = self.flags;
        bytes[3] = self.kind as u8;
        bytes[4..8].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Parses a header from its 8-byte wire form, rejecting a version
    /// mismatch.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(Error::new(
                crate::error::ErrorKind::BufferTooSmall,
                "frame header truncated",
            ));
        }
        let magic = bytes[0];
        let version = bytes[1];
        if version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "unsupported protocol version {version}"
            )));
        }
        if !matches!(
            magic,
            MAGIC_PLAINTEXT | MAGIC_AES_GCM | MAGIC_CHACHA20_POLY1305
        ) {
            return Err(Error::protocol(format!("unknown frame magic {magic:#x}")));
        }
        let flags = bytes[2];
        let kind = FrameKind::from_u8(bytes[3])?;
        let length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            magic,
            version,
            flags,
            kind,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = FrameHeader::new(MAGIC_AES_GCM, FrameKind::Application, 42).compressed();
        let bytes = header.to_bytes();
        let parsed = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_compressed());
    }

    #[test]
    fn rejects_unknown_magic() {
        let mut bytes = FrameHeader::new(MAGIC_AES_GCM, FrameKind::Application, 0).to_bytes();
        bytes[0] = 0x55;
        assert!(FrameHeader::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut bytes = FrameHeader::new(MAGIC_AES_GCM, FrameKind::Application, 0).to_bytes();
        bytes[1] = PROTOCOL_VERSION + 1;
        assert!(FrameHeader::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_truncated_header() {
        let bytes = [MAGIC_AES_GCM, PROTOCOL_VERSION, 0];
        assert!(FrameHeader::parse(&bytes).is_err());
    }
}
