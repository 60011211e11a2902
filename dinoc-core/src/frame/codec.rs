//! Ties the frame header, AEAD cipher, fragmentation and compression layers
//! together into the inbound/outbound pipelines a listener actually calls.
//!
//! Stream transports (TCP, WS) exchange one frame header plus its sealed
//! body per logical message and never fragment. Datagram transports (UDP,
//! ICMP, DNS) wrap every outbound unit in a fragment header, even when it is
//! the only piece, so the inbound side always reassembles before it ever
//! looks for a frame header underneath.

use crate::error::{Error, ErrorKind, Result};
use crate::id::AgentId;

use super::aead::AeadCipher;
use super::compression;
use super::fragment::{self, FragmentHeader, FRAGMENT_HEADER_LEN};
use super::header::{FrameHeader, FrameKind, FRAME_HEADER_LEN};
use super::reassembly::Reassembler;

/// Seals and optionally compresses `plaintext` into a single stream frame:
/// header followed by its sealed body. Used by the TCP and WS listeners.
pub fn encode_outbound(
    plaintext: &[u8],
    kind: FrameKind,
    cipher: &dyn AeadCipher,
    compress: bool,
) -> Result<Vec<u8>> {
    let body = if compress {
        compression::encode(plaintext)
    } else {
        plaintext.to_vec()
    };
    let sealed = cipher.seal(&body)?;
    let mut header = FrameHeader::new(cipher.magic(), kind, sealed.len() as u32);
    if compress {
        header = header.compressed();
    }
    let mut wire = Vec::with_capacity(FRAME_HEADER_LEN + sealed.len());
    wire.extend_from_slice(&header.to_bytes());
    wire.extend_from_slice(&sealed);
    Ok(wire)
}

/// Reverses [`encode_outbound`]: parses the frame header, opens the sealed
/// body and decompresses it if the header's flags call for it.
pub fn decode_inbound(wire: &[u8], cipher: &dyn AeadCipher) -> Result<(Vec<u8>, FrameKind)> {
    let header = FrameHeader::parse(wire)?;
    let body_start = FRAME_HEADER_LEN;
    let body_end = body_start
        .checked_add(header.length as usize)
        .ok_or_else(|| Error::new(ErrorKind::Protocol, "frame length overflow"))?;
    let body = wire
        .get(body_start..body_end)
        .ok_or_else(|| Error::new(ErrorKind::BufferTooSmall, "frame body shorter than header length"))?;
    if header.magic != cipher.magic() {
        return Err(Error::protocol(format!(
            "frame magic {:#x} does not match the session cipher {:#x}",
            header.magic,
            cipher.magic()
        )));
    }
    let opened = cipher.open(body)?;
    let plaintext = if header.is_compressed() {
        compression::decode(&opened)?
    } else {
        opened
    };
    Ok((plaintext, header.kind))
}

/// Same pipeline as [`encode_outbound`], but splits the resulting stream
/// frame into one or more datagrams, each carrying a fragment header. Used
/// by the UDP, ICMP and DNS listeners, whose MTU is smaller than a frame.
pub fn encode_outbound_fragmented(
    plaintext: &[u8],
    kind: FrameKind,
    cipher: &dyn AeadCipher,
    compress: bool,
    fragment_id: u16,
) -> Result<Vec<Vec<u8>>> {
    let wire = encode_outbound(plaintext, kind, cipher, compress)?;
    fragment::split(&wire, fragment_id, compress)?
        .into_iter()
        .map(|(header, chunk)| {
            let mut datagram = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
            datagram.extend_from_slice(&header.to_bytes());
            datagram.extend_from_slice(&chunk);
            Ok(datagram)
        })
        .collect()
}

/// Feeds one inbound datagram through reassembly, returning the decoded
/// frame once every fragment for its `(agent, fragment_id)` has arrived.
pub fn decode_inbound_fragmented(
    agent: AgentId,
    datagram: &[u8],
    cipher: &dyn AeadCipher,
    reassembler: &Reassembler,
) -> Result<Option<(Vec<u8>, FrameKind)>> {
    if datagram.len() < FRAGMENT_HEADER_LEN {
        return Err(Error::new(ErrorKind::BufferTooSmall, "datagram shorter than fragment header"));
    }
    let header = FragmentHeader::parse(&datagram[..FRAGMENT_HEADER_LEN])?;
    let chunk = datagram[FRAGMENT_HEADER_LEN..].to_vec();
    match reassembler.accept(agent, header, chunk)? {
        Some((wire, _compressed)) => decode_inbound(&wire, cipher).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::aead::SessionCipher;

    #[test]
    fn stream_round_trip_compressed() {
        let cipher = SessionCipher::aes_gcm(&[1u8; 32]);
        let plaintext = b"AAAAAAAAAAAAAAAAshell output line".to_vec();
        let wire = encode_outbound(&plaintext, FrameKind::Application, &cipher, true).unwrap();
        let (decoded, kind) = decode_inbound(&wire, &cipher).unwrap();
        assert_eq!(decoded, plaintext);
        assert_eq!(kind, FrameKind::Application);
    }

    #[test]
    fn stream_round_trip_uncompressed() {
        let cipher = SessionCipher::chacha20poly1305(&[2u8; 32]);
        let plaintext = b"HEAR".to_vec();
        let wire = encode_outbound(&plaintext, FrameKind::Application, &cipher, false).unwrap();
        let (decoded, _) = decode_inbound(&wire, &cipher).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn fragmented_round_trip_out_of_order() {
        let cipher = SessionCipher::aes_gcm(&[9u8; 32]);
        let reassembler = Reassembler::new();
        let agent = AgentId::new();
        let plaintext = vec![0x42u8; 5000];
        let mut datagrams =
            encode_outbound_fragmented(&plaintext, FrameKind::Application, &cipher, false, 7).unwrap();
        assert!(datagrams.len() > 1);
        datagrams.reverse();

        let mut result = None;
        for datagram in datagrams {
            result = decode_inbound_fragmented(agent, &datagram, &cipher, &reassembler).unwrap();
        }
        let (decoded, kind) = result.unwrap();
        assert_eq!(decoded, plaintext);
        assert_eq!(kind, FrameKind::Application);
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let cipher = SessionCipher::aes_gcm(&[4u8; 32]);
        let mut wire = encode_outbound(b"short", FrameKind::Application, &cipher, false).unwrap();
        wire.truncate(wire.len() - 1);
        assert!(decode_inbound(&wire, &cipher).is_err());
    }

    #[test]
    fn decode_rejects_a_frame_sealed_with_a_different_cipher_family() {
        let sealing_cipher = SessionCipher::aes_gcm(&[5u8; 32]);
        let session_cipher = SessionCipher::chacha20poly1305(&[5u8; 32]);
        let wire = encode_outbound(b"hello", FrameKind::Application, &sealing_cipher, false).unwrap();
        assert!(decode_inbound(&wire, &session_cipher).is_err());
    }
}
