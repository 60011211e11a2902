//! Frame header, AEAD cipher contract, fragmentation/reassembly and RLE
//! compression — the layer that turns raw transport bytes into application
//! messages and back. See the module-level docs on [`header`], [`aead`],
//! [`fragment`], [`reassembly`] and [`compression`] for the pipeline stages.

pub mod aead;
pub mod codec;
pub mod compression;
pub mod fragment;
pub mod header;
pub mod reassembly;

pub use aead::{AeadCipher, SessionCipher};
pub use codec::{decode_inbound, decode_inbound_fragmented, encode_outbound, encode_outbound_fragmented};
pub use fragment::{FragmentHeader, FRAGMENT_HEADER_LEN, MAX_FRAGMENTS};
pub use header::{FrameHeader, FrameKind, FRAME_HEADER_LEN};
pub use reassembly::Reassembler;
