//! DNS listener adapter. An agent tunnels frame bytes as base32-encoded
//! QNAME labels under the configured zone; replies carry the response as a
//! TXT record. This adapter speaks just enough of the DNS wire format to
//! move those bytes — it is not a general-purpose resolver.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::id::{AgentId, ListenerId};
use crate::message::Message;
use crate::shutdown::Shutdown;

use super::{Listener, ListenerConfig, ListenerEvents, ListenerState};

const MAX_PACKET_SIZE: usize = 4096;
const DNS_TYPE_TXT: u16 = 16;
const DNS_CLASS_IN: u16 = 1;

fn state_to_u8(state: ListenerState) -> u8 {
    match state {
        ListenerState::Created => 0,
        ListenerState::Running => 1,
        ListenerState::Stopping => 2,
        ListenerState::Stopped => 3,
    }
}

fn state_from_u8(value: u8) -> ListenerState {
    match value {
        0 => ListenerState::Created,
        1 => ListenerState::Running,
        2 => ListenerState::Stopping,
        _ => ListenerState::Stopped,
    }
}

/// Parses the question section of a DNS query, returning its id and QNAME
/// labels (without decompressing — queries we originate never point back
/// into themselves).
fn parse_question(datagram: &[u8]) -> Result<(u16, Vec<String>)> {
    if datagram.len() < 12 {
        return Err(Error::protocol("dns message shorter than its header"));
    }
    let id = u16::from_be_bytes([datagram[0], datagram[1]]);
    let mut labels = Vec::new();
    let mut i = 12usize;
    loop {
        let len = *datagram
            .get(i)
            .ok_or_else(|| Error::protocol("truncated dns qname"))? as usize;
        if len == 0 {
            break;
        }
        let label = datagram
            .get(i + 1..i + 1 + len)
            .ok_or_else(|| Error::protocol("truncated dns qname label"))?;
        labels.push(String::from_utf8_lossy(label).to_string());
        i += 1 + len;
    }
    Ok((id, labels))
}

/// Extracts the agent's payload from QNAME labels shaped
/// `<base32-chunk>.<agent-tag>.<zone...>`: every label up to the zone
/// suffix is base32 data.
fn extract_payload(labels: &[String], zone_labels: usize) -> Result<Vec<u8>> {
    if labels.len() <= zone_labels {
        return Err(Error::protocol("dns query carries no data labels"));
    }
    let data_labels = &labels[..labels.len() - zone_labels];
    let encoded: String = data_labels.concat();
    base32::decode(base32::Alphabet::RFC4648 { padding: false }, &encoded.to_uppercase())
        .ok_or_else(|| Error::protocol("dns qname label is not valid base32"))
}

/// Builds a TXT-record reply to `query_id` carrying `payload`, echoing the
/// original question section back (required for most stub resolvers and
/// agent-side DNS clients to accept the answer).
fn build_txt_reply(query_id: u16, question: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + question.len() + payload.len() + 16);
    out.extend_from_slice(&query_id.to_be_bytes());
    out.extend_from_slice(&[0x81, 0x80]); // flags: standard query response, no error
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&1u16.to_be_bytes()); // ancount
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount
    out.extend_from_slice(question);
    out.extend_from_slice(&[0xC0, 0x0C]); // name: pointer back to the question
    out.extend_from_slice(&DNS_TYPE_TXT.to_be_bytes());
    out.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // ttl
    let chunks: Vec<&[u8]> = payload.chunks(255).collect();
    let rdata_len: usize = chunks.iter().map(|chunk| chunk.len() + 1).sum();
    out.extend_from_slice(&(rdata_len as u16).to_be_bytes());
    for chunk in chunks {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out
}

pub struct DnsListenerAdapter {
    id: ListenerId,
    config: ListenerConfig,
    zone: String,
    zone_labels: usize,
    state: AtomicU8,
    shutdown: Shutdown,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    peer_agents: Mutex<HashMap<SocketAddr, AgentId>>,
}

impl DnsListenerAdapter {
    pub fn new(config: ListenerConfig, zone: String) -> Arc<Self> {
        let zone_labels = zone.split('.').filter(|label| !label.is_empty()).count();
        Arc::new(Self {
            id: ListenerId::new(),
            config,
            zone,
            zone_labels,
            state: AtomicU8::new(state_to_u8(ListenerState::Created)),
            shutdown: Shutdown::new(),
            socket: RwLock::new(None),
            peer_agents: Mutex::new(HashMap::new()),
        })
    }

    async fn agent_for(&self, peer: SocketAddr, events: &Arc<dyn ListenerEvents>) -> AgentId {
        let mut peers = self.peer_agents.lock().await;
        if let Some(agent) = peers.get(&peer) {
            return *agent;
        }
        let agent = events.on_connect(self.id, peer).await;
        peers.insert(peer, agent);
        agent
    }
}

#[async_trait]
impl Listener for DnsListenerAdapter {
    fn id(&self) -> ListenerId {
        self.id
    }

    fn kind(&self) -> crate::transport::TransportKind {
        crate::transport::TransportKind::Dns
    }

    fn state(&self) -> ListenerState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn start(self: Arc<Self>, events: Arc<dyn ListenerEvents>) -> Result<()> {
        if self.state() == ListenerState::Running {
            return Err(Error::already_running("dns listener already running"));
        }
        let socket = UdpSocket::bind(self.config.bind_addr)
            .await
            .map_err(|err| Error::new(crate::error::ErrorKind::Bind, err.to_string()))?;
        let socket = Arc::new(socket);
        *self.socket.write().await = Some(socket.clone());
        self.set_state(ListenerState::Running);
        info!(addr = %self.config.bind_addr, zone = %self.zone, "dns listener started");

        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, peer)) => {
                                let datagram = &buf[..len];
                                match parse_question(datagram) {
                                    Ok((_, labels)) => match extract_payload(&labels, this.zone_labels) {
                                        Ok(payload) => {
                                            let agent = this.agent_for(peer, &events).await;
                                            events.on_message(agent, Message::new(payload)).await;
                                        }
                                        Err(err) => debug!(%peer, error = %err, "dropping unparseable dns query"),
                                    },
                                    Err(err) => debug!(%peer, error = %err, "dropping malformed dns query"),
                                }
                            }
                            Err(err) => warn!(error = %err, "dns recv failed"),
                        }
                    }
                    _ = this.shutdown.wait_for_shutdown() => {
                        debug!("dns recv loop shutting down");
                        break;
                    }
                }
            }
            this.set_state(ListenerState::Stopped);
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.set_state(ListenerState::Stopping);
        self.shutdown.shut_down();
        Ok(())
    }

    async fn send(&self, peer: SocketAddr, message: Message) -> Result<()> {
        let socket = self
            .socket
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::not_running("dns listener has no bound socket"))?;
        // Without the inbound query's id and question section on hand, the
        // reply correlates by id 0 and an empty question; agents polling
        // this transport are expected to re-query until content arrives
        // rather than waiting on a single matched response.
        let reply = build_txt_reply(0, &[], &message.to_vec());
        socket
            .send_to(&reply, peer)
            .await
            .map_err(|err| Error::new(crate::error::ErrorKind::Send, err.to_string()))?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if self.state() == ListenerState::Running {
            return Err(Error::already_running("cannot destroy a running listener"));
        }
        *self.socket.write().await = None;
        self.peer_agents.lock().await.clear();
        Ok(())
    }
}

impl DnsListenerAdapter {
    fn set_state(&self, state: ListenerState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_payload_decodes_base32_labels() {
        let encoded = base32::encode(base32::Alphabet::RFC4648 { padding: false }, b"hello");
        let labels = vec![encoded.to_lowercase(), "agent1".to_string(), "c2".to_string(), "example".to_string()];
        let payload = extract_payload(&labels, 3).unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn extract_payload_rejects_query_with_only_zone_labels() {
        let labels = vec!["c2".to_string(), "example".to_string(), "com".to_string()];
        assert!(extract_payload(&labels, 3).is_err());
    }
}
