//! Run-length compression applied to a frame body before it is sealed.
//!
//! A run is encoded as `0x00 <count> <value>` with `count` in `1..=255`.
//! Because `0x00` doubles as the run marker, a literal `0x00` byte that
//! isn't part of a longer run needs its own escape rather than being folded
//! into a one-byte "run": it is written as the two-byte sequence `0x00
//! 0x00`, read back by the decoder as "count zero, no value byte follows,
//! emit one literal zero". Runs of two or more zero bytes still use the
//! three-byte form (`0x00 <count> 0x00`) like any other value. Non-zero
//! bytes are only worth folding into a run once the run is at least four
//! bytes long; anything shorter is cheaper written out literally.
//! Runs longer than 255 bytes are split across multiple markers.

use crate::error::{Error, ErrorKind, Result};

const MARKER: u8 = 0x00;
const MIN_RUN_FOR_NONZERO: usize = 4;

/// Compresses `input` with the escape-aware RLE scheme described above.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        let mut run_len = 1;
        while i + run_len < input.len() && input[i + run_len] == byte {
            run_len += 1;
        }

        if byte == MARKER {
            if run_len == 1 {
                out.push(MARKER);
                out.push(0);
            } else {
                let mut remaining = run_len;
                while remaining > 0 {
                    let chunk = remaining.min(255);
                    out.push(MARKER);
                    out.push(chunk as u8);
                    out.push(MARKER);
                    remaining -= chunk;
                }
            }
        } else if run_len >= MIN_RUN_FOR_NONZERO {
            let mut remaining = run_len;
            while remaining > 0 {
                let chunk = remaining.min(255);
                out.push(MARKER);
                out.push(chunk as u8);
                out.push(byte);
                remaining -= chunk;
            }
        } else {
            out.extend(std::iter::repeat(byte).take(run_len));
        }

        i += run_len;
    }
    out
}

/// Reverses [`encode`], rejecting a body that doesn't parse as valid RLE
/// (a marker byte with nothing, or only a count, left after it).
pub fn decode(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        if byte != MARKER {
            out.push(byte);
            i += 1;
            continue;
        }
        let count = *input.get(i + 1).ok_or_else(|| {
            Error::new(ErrorKind::CompressionInvalid, "truncated run marker: missing count")
        })?;
        if count == 0 {
            out.push(MARKER);
            i += 2;
            continue;
        }
        let value = *input.get(i + 2).ok_or_else(|| {
            Error::new(ErrorKind::CompressionInvalid, "truncated run marker: missing value")
        })?;
        out.extend(std::iter::repeat(value).take(count as usize));
        i += 3;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_input() {
        let input = b"aaaa\x00\x00\x00bbb\x00cccccc".to_vec();
        let encoded = encode(&input);
        assert_eq!(decode(&encoded).unwrap(), input);
    }

    #[test]
    fn lone_zero_byte_escapes() {
        let input = vec![1, 0, 2];
        let encoded = encode(&input);
        assert_eq!(encoded, vec![1, 0x00, 0x00, 2]);
        assert_eq!(decode(&encoded).unwrap(), input);
    }

    #[test]
    fn short_nonzero_run_is_literal() {
        let input = vec![9, 9, 9];
        let encoded = encode(&input);
        assert_eq!(encoded, vec![9, 9, 9]);
    }

    #[test]
    fn long_run_is_split_across_markers() {
        let input = vec![5u8; 600];
        let encoded = encode(&input);
        assert_eq!(decode(&encoded).unwrap(), input);
        assert_eq!(encoded.len(), 9);
    }

    #[test]
    fn empty_input_round_trips() {
        assert_eq!(encode(&[]), Vec::<u8>::new());
        assert_eq!(decode(&[]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rejects_truncated_marker() {
        assert!(decode(&[0x00]).is_err());
        assert!(decode(&[0x00, 0x05]).is_err());
    }
}
