//! The listener abstraction unifying TCP, UDP, WebSocket, ICMP and DNS
//! transports behind one trait, so the rest of the daemon drives all five
//! the same way: create, start, stop, send, destroy.

pub mod dns;
pub mod icmp;
pub mod tcp;
pub mod udp;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::id::{AgentId, ListenerId};
use crate::message::Message;
use crate::transport::TransportKind;

/// A listener's place in its own lifecycle. `start`/`stop` move it between
/// `Running` and `Stopped`; `destroy` is only valid once stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Static configuration a listener is created with.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    pub kind: TransportKind,
}

/// Callbacks a listener invokes as connection and message events happen.
/// Implemented by whatever owns the listener (typically the server
/// bootstrap wiring it to the session registry and task engine).
#[async_trait]
pub trait ListenerEvents: Send + Sync {
    async fn on_connect(&self, listener: ListenerId, peer: SocketAddr) -> AgentId;
    async fn on_message(&self, agent: AgentId, message: Message);
    async fn on_disconnect(&self, agent: AgentId);
}

/// One transport a server can accept agents on. Every adapter
/// (tcp/udp/ws/icmp/dns) implements this the same way so a daemon can hold
/// a heterogeneous `Vec<Arc<dyn Listener>>` and drive them uniformly.
#[async_trait]
pub trait Listener: Send + Sync {
    fn id(&self) -> ListenerId;
    fn kind(&self) -> TransportKind;
    fn state(&self) -> ListenerState;

    /// Binds the underlying socket and spawns the accept/receive loop.
    /// Returns once the loop is running, not once it exits.
    async fn start(self: Arc<Self>, events: Arc<dyn ListenerEvents>) -> Result<()>;

    /// Signals the accept/receive loop to stop and waits for it to exit.
    async fn stop(&self) -> Result<()>;

    /// Sends a message to a specific peer this listener is responsible for.
    async fn send(&self, peer: SocketAddr, message: Message) -> Result<()>;

    /// Releases any resources held after `stop`. A listener that is
    /// `Running` cannot be destroyed.
    async fn destroy(&self) -> Result<()>;
}
