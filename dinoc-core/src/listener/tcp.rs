//! TCP listener adapter. Reads one complete frame (header + body) per
//! message and hands the still-sealed bytes up to [`ListenerEvents`];
//! opening the AEAD body is the session glue's job, not the transport's.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::header::{FrameHeader, FRAME_HEADER_LEN};
use crate::id::{AgentId, ListenerId};
use crate::message::Message;
use crate::shutdown::Shutdown;

use super::{Listener, ListenerConfig, ListenerEvents, ListenerState};

/// Default outbound queue depth per connection. A send beyond this is
/// rejected with a transient backpressure error rather than blocking the
/// caller.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

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

pub struct TcpListenerAdapter {
    id: ListenerId,
    config: ListenerConfig,
    state: AtomicU8,
    shutdown: Shutdown,
    peers: DashMap<SocketAddr, mpsc::Sender<Message>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    worker_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpListenerAdapter {
    pub fn new(config: ListenerConfig) -> Arc<Self> {
        Arc::new(Self {
            id: ListenerId::new(),
            config,
            state: AtomicU8::new(state_to_u8(ListenerState::Created)),
            shutdown: Shutdown::new(),
            peers: DashMap::new(),
            accept_task: Mutex::new(None),
            worker_tasks: Mutex::new(Vec::new()),
        })
    }

    fn set_state(&self, state: ListenerState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        events: Arc<dyn ListenerEvents>,
    ) {
        let agent = events.on_connect(self.id, peer).await;
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);
        self.peers.insert(peer, tx);

        let (mut read_half, mut write_half) = stream.split();
        let shutdown = self.shutdown.clone();

        let writer = async {
            while let Some(message) = rx.recv().await {
                if let Err(err) = write_half.write_all(&message.to_vec()).await {
                    warn!(%peer, error = %err, "tcp write failed");
                    break;
                }
            }
        };

        let reader = async {
            loop {
                let mut header_bytes = [0u8; FRAME_HEADER_LEN];
                if let Err(err) = read_half.read_exact(&mut header_bytes).await {
                    debug!(%peer, error = %err, "tcp connection closed");
                    break;
                }
                let header = match FrameHeader::parse(&header_bytes) {
                    Ok(header) => header,
                    Err(err) => {
                        warn!(%peer, error = %err, "dropping connection on malformed frame header");
                        break;
                    }
                };
                let mut body = vec![0u8; header.length as usize];
                if let Err(err) = read_half.read_exact(&mut body).await {
                    warn!(%peer, error = %err, "tcp connection closed mid-frame");
                    break;
                }
                let mut full = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
                full.extend_from_slice(&header_bytes);
                full.extend_from_slice(&body);
                events.on_message(agent, Message::new(full)).await;
            }
        };

        tokio::select! {
            _ = reader => {}
            _ = writer => {}
            _ = shutdown.wait_for_shutdown() => {
                debug!(%peer, "tcp connection shut down");
            }
        }

        self.peers.remove(&peer);
        events.on_disconnect(agent).await;
    }
}

#[async_trait]
impl Listener for TcpListenerAdapter {
    fn id(&self) -> ListenerId {
        self.id
    }

    fn kind(&self) -> crate::transport::TransportKind {
        crate::transport::TransportKind::Tcp
    }

    fn state(&self) -> ListenerState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn start(self: Arc<Self>, events: Arc<dyn ListenerEvents>) -> Result<()> {
        if self.state() == ListenerState::Running {
            return Err(Error::already_running("tcp listener already running"));
        }
        let tcp_listener = TokioTcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|err| Error::new(crate::error::ErrorKind::Bind, err.to_string()))?;
        self.set_state(ListenerState::Running);
        info!(addr = %self.config.bind_addr, "tcp listener started");

        let this = self.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = tcp_listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let this = this.clone();
                                let events = events.clone();
                                let worker = tokio::spawn(this.clone().handle_connection(stream, peer, events));
                                this.worker_tasks.lock().await.push(worker);
                            }
                            Err(err) => warn!(error = %err, "tcp accept failed"),
                        }
                    }
                    _ = this.shutdown.wait_for_shutdown() => {
                        debug!("tcp accept loop shutting down");
                        break;
                    }
                }
            }
            this.set_state(ListenerState::Stopped);
        });
        *self.accept_task.lock().await = Some(accept_task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.set_state(ListenerState::Stopping);
        self.shutdown.shut_down();
        if let Some(accept_task) = self.accept_task.lock().await.take() {
            if let Err(err) = accept_task.await {
                warn!(error = %err, "tcp accept loop task panicked");
            }
        }
        let workers = std::mem::take(&mut *self.worker_tasks.lock().await);
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "tcp connection worker task panicked");
            }
        }
        Ok(())
    }

    async fn send(&self, peer: SocketAddr, message: Message) -> Result<()> {
        let sender = self
            .peers
            .get(&peer)
            .ok_or_else(|| Error::not_found(format!("no tcp peer {peer}")))?
            .clone();
        sender.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::new(crate::error::ErrorKind::Send, "backpressure"),
            mpsc::error::TrySendError::Closed(_) => {
                Error::new(crate::error::ErrorKind::Send, "peer channel closed")
            }
        })
    }

    async fn destroy(&self) -> Result<()> {
        if self.state() == ListenerState::Running {
            return Err(Error::already_running("cannot destroy a running listener"));
        }
        self.peers.clear();
        Ok(())
    }
}
