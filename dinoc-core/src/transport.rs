//! The transport kinds a listener can speak and the per-agent attachment
//! that lets a session address outbound frames at the right one.

use crate::id::ListenerId;
use std::fmt;
use std::net::SocketAddr;

/// Which of the five supported transports a listener or agent is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
    Ws,
    Icmp,
    Dns,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Ws => "ws",
            TransportKind::Icmp => "icmp",
            TransportKind::Dns => "dns",
        };
        f.write_str(s)
    }
}

/// The opaque per-agent attachment that lets the session registry address
/// an outbound frame at whatever transport the agent is currently using,
/// without the registry needing to know transport-specific details. A
/// handle only names where to send, not how: actually writing bytes out
/// still goes through the owning [`crate::listener::Listener`]'s `send`,
/// looked up by `listener_id()`.
///
/// This replaces a `void*` protocol context with a sum type: one variant per
/// transport, so a lookup into transport-specific state can never be
/// applied against the wrong transport kind.
#[derive(Debug, Clone, Copy)]
pub enum TransportHandle {
    Tcp { listener: ListenerId, peer: SocketAddr },
    Udp { listener: ListenerId, peer: SocketAddr },
    Ws { listener: ListenerId, peer: SocketAddr },
    Icmp { listener: ListenerId, peer: SocketAddr },
    Dns { listener: ListenerId, peer: SocketAddr },
}

impl TransportHandle {
    pub fn new(kind: TransportKind, listener: ListenerId, peer: SocketAddr) -> Self {
        match kind {
            TransportKind::Tcp => TransportHandle::Tcp { listener, peer },
            TransportKind::Udp => TransportHandle::Udp { listener, peer },
            TransportKind::Ws => TransportHandle::Ws { listener, peer },
            TransportKind::Icmp => TransportHandle::Icmp { listener, peer },
            TransportKind::Dns => TransportHandle::Dns { listener, peer },
        }
    }
}

impl TransportHandle {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportHandle::Tcp { .. } => TransportKind::Tcp,
            TransportHandle::Udp { .. } => TransportKind::Udp,
            TransportHandle::Ws { .. } => TransportKind::Ws,
            TransportHandle::Icmp { .. } => TransportKind::Icmp,
            TransportHandle::Dns { .. } => TransportKind::Dns,
        }
    }

    pub fn listener_id(&self) -> ListenerId {
        match self {
            TransportHandle::Tcp { listener, .. }
            | TransportHandle::Udp { listener, .. }
            | TransportHandle::Ws { listener, .. }
            | TransportHandle::Icmp { listener, .. }
            | TransportHandle::Dns { listener, .. } => *listener,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            TransportHandle::Tcp { peer, .. }
            | TransportHandle::Udp { peer, .. }
            | TransportHandle::Ws { peer, .. }
            | TransportHandle::Icmp { peer, .. }
            | TransportHandle::Dns { peer, .. } => *peer,
        }
    }
}
