//! Wire payload for the registration handshake: the first frame an agent
//! sends is sealed with the bootstrap cipher and carries one of these
//! bodies, naming the identity to register, the AEAD family it wants the
//! session sealed with from then on, and its requested heartbeat cadence.

use crate::error::{Error, Result};
use crate::id::AgentId;

use super::agent::AgentInfo;

/// All-zero bytes in the `rejoin` field mean "register as a brand new
/// agent" rather than naming an existing one to re-home onto this
/// transport, since a real [`AgentId`] is never the nil UUID.
const NIL_AGENT_BYTES: [u8; 16] = [0u8; 16];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationPayload {
    /// Set when an already-registered agent is reconnecting on a new
    /// transport (the `ProtocolSwitch` flow), so the registry re-homes the
    /// existing session instead of minting a new identity.
    pub rejoin: Option<AgentId>,
    pub cipher_magic: u8,
    /// Requested heartbeat cadence; validated and applied by
    /// `SessionRegistry::set_heartbeat` once the agent is admitted.
    pub heartbeat_interval_secs: u32,
    pub heartbeat_jitter_secs: u32,
    pub info: AgentInfo,
}

impl RegistrationPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.rejoin.map(AgentId::to_bytes).unwrap_or(NIL_AGENT_BYTES));
        out.push(self.cipher_magic);
        out.extend_from_slice(&self.heartbeat_interval_secs.to_be_bytes());
        out.extend_from_slice(&self.heartbeat_jitter_secs.to_be_bytes());
        push_string(&mut out, &self.info.hostname);
        push_string(&mut out, &self.info.os);
        push_string(&mut out, &self.info.username);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 25 {
            return Err(Error::protocol("registration payload truncated"));
        }
        let mut rejoin_bytes = [0u8; 16];
        rejoin_bytes.copy_from_slice(&bytes[0..16]);
        let rejoin = (rejoin_bytes != NIL_AGENT_BYTES).then(|| AgentId::from_bytes(rejoin_bytes));
        let cipher_magic = bytes[16];
        let heartbeat_interval_secs = u32::from_be_bytes([bytes[17], bytes[18], bytes[19], bytes[20]]);
        let heartbeat_jitter_secs = u32::from_be_bytes([bytes[21], bytes[22], bytes[23], bytes[24]]);
        let mut cursor = 25usize;
        let hostname = pop_string(bytes, &mut cursor)?;
        let os = pop_string(bytes, &mut cursor)?;
        let username = pop_string(bytes, &mut cursor)?;
        Ok(Self {
            rejoin,
            cipher_magic,
            heartbeat_interval_secs,
            heartbeat_jitter_secs,
            info: AgentInfo { hostname, os, username },
        })
    }
}

fn push_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn pop_string(bytes: &[u8], cursor: &mut usize) -> Result<String> {
    let len_bytes = bytes
        .get(*cursor..*cursor + 2)
        .ok_or_else(|| Error::protocol("registration payload truncated before a field length"))?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    *cursor += 2;
    let value = bytes
        .get(*cursor..*cursor + len)
        .ok_or_else(|| Error::protocol("registration payload truncated before a field value"))?;
    *cursor += len;
    String::from_utf8(value.to_vec()).map_err(|_| Error::protocol("registration field is not utf-8"))
}
