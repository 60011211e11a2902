//! Listener, framing and session/task substrate for a multi-protocol
//! command-and-control daemon.
//!
//! # Organization
//!
//! - [`listener`] unifies TCP, UDP, WebSocket, ICMP and DNS transports
//!   behind one [`listener::Listener`] trait.
//! - [`frame`] is the wire layer: the self-describing frame header, the
//!   AEAD contract, fragmentation/reassembly for datagram transports, and
//!   RLE compression.
//! - [`session`] tracks connected agents and their liveness.
//! - [`task`] models the lifecycle of work dispatched to an agent.
//! - [`message`] is the zero-copy byte container the rest of the crate
//!   builds frame and fragment bodies out of.
//! - [`transport`] names the supported transports and the per-agent handle
//!   that addresses outbound frames at the right one.
//! - [`error`] and [`id`] are shared across every other module.

pub mod error;
pub mod frame;
pub mod id;
pub mod listener;
pub mod message;
pub mod session;
pub mod shutdown;
pub mod task;
pub mod transport;

pub use error::{Error, ErrorKind, Result};
pub use message::Message;
pub use shutdown::{ExitStatus, Shutdown};

use dashmap::DashMap;
use std::hash::BuildHasherDefault;

/// A `DashMap` keyed with the faster, non-cryptographic `FxHasher`, used
/// wherever keys are already-random identifiers (UUIDs) that don't need a
/// DoS-resistant hash.
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
