//! WebSocket listener adapter. A WS message already carries its own
//! boundary like a UDP datagram, so frame parsing happens above this layer;
//! this adapter only moves binary WS messages in and out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::id::{AgentId, ListenerId};
use crate::message::Message;
use crate::shutdown::Shutdown;

use super::{Listener, ListenerConfig, ListenerEvents, ListenerState};

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

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

pub struct WsListenerAdapter {
    id: ListenerId,
    config: ListenerConfig,
    state: AtomicU8,
    shutdown: Shutdown,
    peers: DashMap<SocketAddr, mpsc::Sender<Message>>,
}

impl WsListenerAdapter {
    pub fn new(config: ListenerConfig) -> Arc<Self> {
        Arc::new(Self {
            id: ListenerId::new(),
            config,
            state: AtomicU8::new(state_to_u8(ListenerState::Created)),
            shutdown: Shutdown::new(),
            peers: DashMap::new(),
        })
    }

    fn set_state(&self, state: ListenerState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        events: Arc<dyn ListenerEvents>,
    ) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!(%peer, error = %err, "websocket handshake failed");
                return;
            }
        };
        let (mut sink, mut stream) = ws_stream.split();

        let agent = events.on_connect(self.id, peer).await;
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);
        self.peers.insert(peer, tx);
        let shutdown = self.shutdown.clone();

        let writer = async {
            while let Some(message) = rx.recv().await {
                if let Err(err) = sink.send(WsMessage::Binary(message.to_vec())).await {
                    warn!(%peer, error = %err, "websocket write failed");
                    break;
                }
            }
        };

        let reader = async {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Binary(bytes)) => {
                        events.on_message(agent, Message::new(bytes)).await;
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(%peer, error = %err, "websocket connection closed");
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = reader => {}
            _ = writer => {}
            _ = shutdown.wait_for_shutdown() => {
                debug!(%peer, "websocket connection shut down");
            }
        }

        self.peers.remove(&peer);
        events.on_disconnect(agent).await;
    }
}

#[async_trait]
impl Listener for WsListenerAdapter {
    fn id(&self) -> ListenerId {
        self.id
    }

    fn kind(&self) -> crate::transport::TransportKind {
        crate::transport::TransportKind::Ws
    }

    fn state(&self) -> ListenerState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn start(self: Arc<Self>, events: Arc<dyn ListenerEvents>) -> Result<()> {
        if self.state() == ListenerState::Running {
            return Err(Error::already_running("ws listener already running"));
        }
        let tcp_listener = TokioTcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|err| Error::new(crate::error::ErrorKind::Bind, err.to_string()))?;
        self.set_state(ListenerState::Running);
        info!(addr = %self.config.bind_addr, "ws listener started");

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = tcp_listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let this = this.clone();
                                let events = events.clone();
                                tokio::spawn(this.handle_connection(stream, peer, events));
                            }
                            Err(err) => warn!(error = %err, "ws accept failed"),
                        }
                    }
                    _ = this.shutdown.wait_for_shutdown() => {
                        debug!("ws accept loop shutting down");
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
        let sender = self
            .peers
            .get(&peer)
            .ok_or_else(|| Error::not_found(format!("no ws peer {peer}")))?
            .clone();
        sender
            .send(message)
            .await
            .map_err(|_| Error::new(crate::error::ErrorKind::Send, "peer channel closed"))
    }

    async fn destroy(&self) -> Result<()> {
        if self.state() == ListenerState::Running {
            return Err(Error::already_running("cannot destroy a running listener"));
        }
        self.peers.clear();
        Ok(())
    }
}
