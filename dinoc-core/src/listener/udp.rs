//! UDP listener adapter. Unlike TCP, a datagram already carries its own
//! boundary, so each recv is handed up to [`ListenerEvents`] exactly as
//! received — fragment/frame parsing happens above this layer.

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

const MAX_DATAGRAM_SIZE: usize = 65507;

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

pub struct UdpListenerAdapter {
    id: ListenerId,
    config: ListenerConfig,
    state: AtomicU8,
    shutdown: Shutdown,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    peer_agents: Mutex<HashMap<SocketAddr, AgentId>>,
}

impl UdpListenerAdapter {
    pub fn new(config: ListenerConfig) -> Arc<Self> {
        Arc::new(Self {
            id: ListenerId::new(),
            config,
            state: AtomicU8::new(state_to_u8(ListenerState::Created)),
            shutdown: Shutdown::new(),
            socket: RwLock::new(None),
            peer_agents: Mutex::new(HashMap::new()),
        })
    }

    fn set_state(&self, state: ListenerState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
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
impl Listener for UdpListenerAdapter {
    fn id(&self) -> ListenerId {
        self.id
    }

    fn kind(&self) -> crate::transport::TransportKind {
        crate::transport::TransportKind::Udp
    }

    fn state(&self) -> ListenerState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn start(self: Arc<Self>, events: Arc<dyn ListenerEvents>) -> Result<()> {
        if self.state() == ListenerState::Running {
            return Err(Error::already_running("udp listener already running"));
        }
        let socket = UdpSocket::bind(self.config.bind_addr)
            .await
            .map_err(|err| Error::new(crate::error::ErrorKind::Bind, err.to_string()))?;
        let socket = Arc::new(socket);
        *self.socket.write().await = Some(socket.clone());
        self.set_state(ListenerState::Running);
        info!(addr = %self.config.bind_addr, "udp listener started");

        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, peer)) => {
                                let agent = this.agent_for(peer, &events).await;
                                events.on_message(agent, Message::new(buf[..len].to_vec())).await;
                            }
                            Err(err) => warn!(error = %err, "udp recv failed"),
                        }
                    }
                    _ = this.shutdown.wait_for_shutdown() => {
                        debug!("udp recv loop shutting down");
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
            .ok_or_else(|| Error::not_running("udp listener has no bound socket"))?;
        socket
            .send_to(&message.to_vec(), peer)
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
