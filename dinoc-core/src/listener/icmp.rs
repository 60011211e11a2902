//! ICMP listener adapter. Tunnels frame bytes inside ICMP echo
//! request/reply payloads, identifying an agent by `(source ip, icmp id)`
//! since several agents can share a source address.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::id::{AgentId, ListenerId};
use crate::message::Message;
use crate::shutdown::Shutdown;

use super::{Listener, ListenerConfig, ListenerEvents, ListenerState};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const MAX_PACKET_SIZE: usize = 4096;

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

/// One's-complement checksum over `bytes`, treating the two bytes at
/// `checksum_offset` as zero while summing, per the ICMP checksum rule.
fn icmp_checksum(bytes: &[u8], checksum_offset: usize) -> u16 {
    let mut sum = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        let word = if i == checksum_offset {
            0u16
        } else if i + 1 < bytes.len() {
            u16::from_be_bytes([bytes[i], bytes[i + 1]])
        } else {
            (bytes[i] as u16) << 8
        };
        sum += word as u32;
        i += 2;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn build_icmp_packet(icmp_type: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.push(icmp_type);
    packet.push(0); // code
    packet.extend_from_slice(&[0, 0]); // checksum placeholder
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(payload);
    let checksum = icmp_checksum(&packet, 2);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Parses a raw datagram off an `IPPROTO_ICMP` socket, which on Linux
/// includes the IPv4 header in front of the ICMP message.
fn parse_icmp(datagram: &[u8]) -> Result<(u8, u16, u16, Vec<u8>)> {
    if datagram.is_empty() {
        return Err(Error::protocol("empty icmp datagram"));
    }
    let ihl = ((datagram[0] & 0x0F) as usize) * 4;
    let icmp = datagram
        .get(ihl..)
        .ok_or_else(|| Error::protocol("icmp datagram shorter than its IP header"))?;
    if icmp.len() < 8 {
        return Err(Error::protocol("icmp message shorter than its header"));
    }
    let icmp_type = icmp[0];
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    Ok((icmp_type, id, seq, icmp[8..].to_vec()))
}

pub struct IcmpListenerAdapter {
    id: ListenerId,
    config: ListenerConfig,
    state: AtomicU8,
    shutdown: Shutdown,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    /// Keyed by source IP; a second agent knocking from the same address
    /// with a different icmp id displaces the first. Real deployments
    /// rarely multiplex several agents behind one address on this
    /// transport, so this adapter doesn't try to disambiguate further.
    peer_agents: Mutex<HashMap<IpAddr, (u16, AgentId)>>,
    sequence: AtomicU16,
}

impl IcmpListenerAdapter {
    pub fn new(config: ListenerConfig) -> Arc<Self> {
        Arc::new(Self {
            id: ListenerId::new(),
            config,
            state: AtomicU8::new(state_to_u8(ListenerState::Created)),
            shutdown: Shutdown::new(),
            socket: RwLock::new(None),
            peer_agents: Mutex::new(HashMap::new()),
            sequence: AtomicU16::new(0),
        })
    }

    fn set_state(&self, state: ListenerState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
    }

    async fn agent_for(&self, ip: IpAddr, icmp_id: u16, peer: SocketAddr, events: &Arc<dyn ListenerEvents>) -> AgentId {
        let mut peers = self.peer_agents.lock().await;
        if let Some((_, agent)) = peers.get(&ip) {
            return *agent;
        }
        let agent = events.on_connect(self.id, peer).await;
        peers.insert(ip, (icmp_id, agent));
        agent
    }
}

#[async_trait]
impl Listener for IcmpListenerAdapter {
    fn id(&self) -> ListenerId {
        self.id
    }

    fn kind(&self) -> crate::transport::TransportKind {
        crate::transport::TransportKind::Icmp
    }

    fn state(&self) -> ListenerState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn start(self: Arc<Self>, events: Arc<dyn ListenerEvents>) -> Result<()> {
        if self.state() == ListenerState::Running {
            return Err(Error::already_running("icmp listener already running"));
        }
        let raw = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(|err| Error::new(crate::error::ErrorKind::Socket, err.to_string()))?;
        raw.set_nonblocking(true)
            .map_err(|err| Error::new(crate::error::ErrorKind::Socket, err.to_string()))?;
        raw.bind(&self.config.bind_addr.into())
            .map_err(|err| Error::new(crate::error::ErrorKind::Bind, err.to_string()))?;
        let std_socket: std::net::UdpSocket = raw.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|err| Error::new(crate::error::ErrorKind::Socket, err.to_string()))?;
        let socket = Arc::new(socket);
        *self.socket.write().await = Some(socket.clone());
        self.set_state(ListenerState::Running);
        info!(addr = %self.config.bind_addr, "icmp listener started");

        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, peer)) => {
                                match parse_icmp(&buf[..len]) {
                                    Ok((icmp_type, id, _seq, payload)) if icmp_type == ICMP_ECHO_REQUEST && !payload.is_empty() => {
                                        let agent = this.agent_for(peer.ip(), id, peer, &events).await;
                                        events.on_message(agent, Message::new(payload)).await;
                                    }
                                    Ok(_) => {}
                                    Err(err) => debug!(error = %err, "dropping unparseable icmp datagram"),
                                }
                            }
                            Err(err) => warn!(error = %err, "icmp recv failed"),
                        }
                    }
                    _ = this.shutdown.wait_for_shutdown() => {
                        debug!("icmp recv loop shutting down");
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
            .ok_or_else(|| Error::not_running("icmp listener has no bound socket"))?;
        let id = self
            .peer_agents
            .lock()
            .await
            .get(&peer.ip())
            .map(|(icmp_id, _)| *icmp_id)
            .unwrap_or(0);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let packet = build_icmp_packet(ICMP_ECHO_REPLY, id, seq, &message.to_vec());
        socket
            .send_to(&packet, peer)
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
