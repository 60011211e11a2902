//! Fragment reassembly, keyed by `(agent, fragment_id)`. Grounded in the
//! bitset-tracked, timeout-swept reassembly table this codebase has used for
//! out-of-order datagram reassembly elsewhere, re-targeted at the agent/task
//! substrate instead of IP packets.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::fragment::{checksum_over, FragmentHeader};
use crate::error::{Error, ErrorKind, Result};
use crate::id::AgentId;

/// An in-flight reassembly with no new fragment in this long is evicted by
/// the sweep, regardless of how many pieces it's still missing.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct PartialBody {
    total: u8,
    received: Vec<bool>,
    chunks: Vec<Vec<u8>>,
    compressed: bool,
    last_seen: Instant,
}

impl PartialBody {
    fn new(n: u8, compressed: bool) -> Self {
        Self {
            total: n,
            received: vec![false; n as usize],
            chunks: vec![Vec::new(); n as usize],
            compressed,
            last_seen: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|&seen| seen)
    }

    fn assemble(self) -> Vec<u8> {
        self.chunks.into_iter().flatten().collect()
    }
}

/// Tracks fragments in flight per agent and reassembles them once every
/// piece has arrived, in any order, duplicates tolerated.
pub struct Reassembler {
    partials: DashMap<(AgentId, u16), PartialBody>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            partials: DashMap::new(),
        }
    }

    /// Feeds one fragment in, verifying its checksum. Returns the
    /// reassembled body and whether it was compressed once the last
    /// fragment for this `(agent, fragment_id)` arrives.
    pub fn accept(
        &self,
        agent: AgentId,
        header: FragmentHeader,
        body: Vec<u8>,
    ) -> Result<Option<(Vec<u8>, bool)>> {
        if header.checksum != checksum_over(&header, &body) {
            return Err(Error::new(ErrorKind::Checksum, "fragment checksum mismatch"));
        }
        let key = (agent, header.fragment_id);
        {
            let mut partial = self
                .partials
                .entry(key)
                .or_insert_with(|| PartialBody::new(header.n, header.is_compressed()));
            if partial.total != header.n {
                return Err(Error::protocol(
                    "fragment count mismatch for in-flight reassembly",
                ));
            }
            let idx = header.idx as usize;
            if !partial.received[idx] {
                partial.received[idx] = true;
                partial.chunks[idx] = body;
            }
            partial.last_seen = Instant::now();
            if !partial.is_complete() {
                return Ok(None);
            }
        }
        let (_, partial) = self
            .partials
            .remove(&key)
            .expect("entry observed complete under the same key");
        Ok(Some((partial.assemble(), partial.compressed)))
    }

    /// Evicts reassemblies idle for longer than [`REASSEMBLY_TIMEOUT`],
    /// returning how many were dropped. Intended to run on a periodic
    /// sweep alongside the session heartbeat and task timeout sweeps.
    pub fn sweep_expired(&self) -> usize {
        let before = self.partials.len();
        self.partials
            .retain(|_, partial| partial.last_seen.elapsed() < REASSEMBLY_TIMEOUT);
        before - self.partials.len()
    }

    pub fn in_flight(&self) -> usize {
        self.partials.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::fragment::split;

    #[test]
    fn reassembles_in_order() {
        let reassembler = Reassembler::new();
        let agent = AgentId::new();
        let body = b"the quick brown fox jumps over the lazy dog".to_vec();
        let fragments = split(&body, 1, false).unwrap();
        let mut result = None;
        for (header, chunk) in fragments {
            result = reassembler.accept(agent, header, chunk).unwrap();
        }
        assert_eq!(result.unwrap().0, body);
        assert_eq!(reassembler.in_flight(), 0);
    }

    #[test]
    fn reassembles_out_of_order() {
        let reassembler = Reassembler::new();
        let agent = AgentId::new();
        let body = vec![7u8; super::super::fragment::MAX_FRAGMENT_BODY * 2 + 50];
        let mut fragments = split(&body, 5, true).unwrap();
        fragments.reverse();
        let mut result = None;
        for (header, chunk) in fragments {
            result = reassembler.accept(agent, header, chunk).unwrap();
        }
        let (reassembled, compressed) = result.unwrap();
        assert_eq!(reassembled, body);
        assert!(compressed);
    }

    #[test]
    fn duplicate_fragment_is_harmless() {
        let reassembler = Reassembler::new();
        let agent = AgentId::new();
        let fragments = split(b"hello world", 9, false).unwrap();
        let (header, chunk) = fragments[0].clone();
        assert!(reassembler
            .accept(agent, header, chunk.clone())
            .unwrap()
            .is_none());
        assert!(reassembler.accept(agent, header, chunk).unwrap().is_none());
        assert_eq!(reassembler.in_flight(), 1);
    }

    #[test]
    fn rejects_bad_checksum() {
        let reassembler = Reassembler::new();
        let agent = AgentId::new();
        let fragments = split(b"hello world", 2, false).unwrap();
        let (mut header, chunk) = fragments[0].clone();
        header.checksum ^= 0xFFFF;
        assert!(reassembler.accept(agent, header, chunk).is_err());
    }

    #[test]
    fn sweep_evicts_stale_partials() {
        let reassembler = Reassembler::new();
        let agent = AgentId::new();
        let fragments = split(b"partial only", 3, false).unwrap();
        let (header, chunk) = fragments[0].clone();
        reassembler.accept(agent, header, chunk).unwrap();
        if let Some(mut partial) = reassembler.partials.get_mut(&(agent, 3)) {
            partial.last_seen = Instant::now() - REASSEMBLY_TIMEOUT - Duration::from_secs(1);
        }
        assert_eq!(reassembler.sweep_expired(), 1);
        assert_eq!(reassembler.in_flight(), 0);
    }
}
