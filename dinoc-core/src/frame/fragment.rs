//! Per-fragment header for datagram transports (UDP, ICMP, DNS) whose MTU is
//! smaller than a frame body. TCP and WS carry a frame as one unit and never
//! produce fragments.
//!
//! ```text
//!  0..1          2       3       4       5..6
//! +------------+-------+-------+-------+----------+
//! | fragment_id|  idx  |   n   | flags | checksum |
//! +------------+-------+-------+-------+----------+
//! ```

use crate::error::{Error, ErrorKind, Result};

/// Total size of a [`FragmentHeader`] on the wire.
pub const FRAGMENT_HEADER_LEN: usize = 7;

/// `idx` and `n` are single bytes, so a fragmented frame can carry at most
/// this many pieces.
pub const MAX_FRAGMENTS: usize = 255;

/// Largest body a single fragment may carry, chosen to sit comfortably under
/// a conservative path MTU once header overhead from the framing layers
/// above is accounted for.
pub const MAX_FRAGMENT_BODY: usize = 1200;

/// Bit 0 of [`FragmentHeader::flags`]: the reassembled body was
/// RLE-compressed before fragmentation.
pub const FRAGMENT_FLAG_COMPRESSED: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragment_id: u16,
    pub idx: u8,
    pub n: u8,
    pub flags: u8,
    pub checksum: u16,
}

impl FragmentHeader {
    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_LEN] {
        let mut bytes = [0u8; FRAGMENT_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.fragment_id.to_be_bytes());
        bytes[2] = self.idx;
        bytes[3] = self.n;
        bytes[4] = self.flags;
        bytes[5..7].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return Err(Error::new(ErrorKind::BufferTooSmall, "fragment header truncated"));
        }
        let fragment_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let idx = bytes[2];
        let n = bytes[3];
        let flags = bytes[4];
        let checksum = u16::from_be_bytes([bytes[5], bytes[6]]);
        if n == 0 || idx >= n {
            return Err(Error::protocol(format!("invalid fragment index {idx} of {n}")));
        }
        Ok(Self {
            fragment_id,
            idx,
            n,
            flags,
            checksum,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FRAGMENT_FLAG_COMPRESSED != 0
    }
}

/// One's-complement checksum over an arbitrary byte string, matching the
/// internet checksum algorithm used elsewhere in this codebase's ancestry.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut iter = bytes.chunks_exact(2);
    for chunk in &mut iter {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = iter.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// The checksum that actually covers a fragment: the header with its
/// `checksum` field zeroed, followed by the body. Covering the header too
/// means a corrupted `fragment_id`/`idx`/`n`/`flags` is caught, not just a
/// corrupted body.
pub fn checksum_over(header: &FragmentHeader, body: &[u8]) -> u16 {
    let mut zeroed = *header;
    zeroed.checksum = 0;
    let mut buf = Vec::with_capacity(FRAGMENT_HEADER_LEN + body.len());
    buf.extend_from_slice(&zeroed.to_bytes());
    buf.extend_from_slice(body);
    checksum(&buf)
}

/// Splits `body` into up to [`MAX_FRAGMENTS`] pieces of at most
/// [`MAX_FRAGMENT_BODY`] bytes each, pairing each with its header.
pub fn split(body: &[u8], fragment_id: u16, compressed: bool) -> Result<Vec<(FragmentHeader, Vec<u8>)>> {
    if body.is_empty() {
        return Err(Error::invalid_argument("cannot fragment an empty body"));
    }
    let n = body.chunks(MAX_FRAGMENT_BODY).count();
    if n > MAX_FRAGMENTS {
        return Err(Error::invalid_argument(format!(
            "body requires {n} fragments, more than the {MAX_FRAGMENTS} maximum"
        )));
    }
    let flags = if compressed { FRAGMENT_FLAG_COMPRESSED } else { 0 };
    Ok(body
        .chunks(MAX_FRAGMENT_BODY)
        .enumerate()
        .map(|(idx, chunk)| {
            let mut header = FragmentHeader {
                fragment_id,
                idx: idx as u8,
                n: n as u8,
                flags,
                checksum: 0,
            };
            header.checksum = checksum_over(&header, chunk);
            (header, chunk.to_vec())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = FragmentHeader {
            fragment_id: 0xBEEF,
            idx: 1,
            n: 3,
            flags: FRAGMENT_FLAG_COMPRESSED,
            checksum: 0x1234,
        };
        let bytes = header.to_bytes();
        assert_eq!(FragmentHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_idx_out_of_range() {
        let mut bytes = FragmentHeader {
            fragment_id: 1,
            idx: 0,
            n: 1,
            flags: 0,
            checksum: 0,
        }
        .to_bytes();
        bytes[2] = 5;
        assert!(FragmentHeader::parse(&bytes).is_err());
    }

    #[test]
    fn checksum_detects_corruption() {
        let body = b"the quick brown fox";
        let sum = checksum(body);
        let mut corrupted = body.to_vec();
        corrupted[0] ^= 0xFF;
        assert_ne!(checksum(&corrupted), sum);
    }

    #[test]
    fn split_produces_expected_fragment_count() {
        let body = vec![0xAB; MAX_FRAGMENT_BODY * 3 + 10];
        let fragments = split(&body, 42, false).unwrap();
        assert_eq!(fragments.len(), 4);
        for (header, chunk) in &fragments {
            assert_eq!(header.checksum, checksum_over(header, chunk));
            assert_eq!(header.fragment_id, 42);
        }
    }

    #[test]
    fn split_rejects_empty_body() {
        assert!(split(&[], 1, false).is_err());
    }
}
