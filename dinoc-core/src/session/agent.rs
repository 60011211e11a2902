//! A single agent's identity, liveness and transport attachment.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::id::AgentId;
use crate::transport::TransportHandle;

/// An agent's place in its connection lifecycle. `Active` and `Inactive`
/// cycle against each other as heartbeats arrive or go quiet; only a missed
/// [`super::registry::SessionRegistry`] timeout sweep moves an agent to
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    New,
    Connected,
    Registered,
    Active,
    Inactive,
    Disconnected,
}

impl AgentState {
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (New, Connected)
                | (Connected, Registered)
                | (Registered, Active)
                | (Active, Inactive)
                | (Inactive, Active)
                | (Active, Disconnected)
                | (Inactive, Disconnected)
                | (Connected, Disconnected)
                | (Registered, Disconnected)
        )
    }
}

/// Agent-reported identity collected during registration.
#[derive(Debug, Clone, Default)]
pub struct AgentInfo {
    pub hostname: String,
    pub os: String,
    pub username: String,
}

/// Heartbeat cadence used until an agent's registration requests its own,
/// via [`Agent::set_heartbeat`].
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_JITTER: Duration = Duration::from_secs(0);

/// A connected agent. Cheap to clone behind an `Arc`; all mutable state is
/// behind interior locks so the registry can hand out shared references.
pub struct Agent {
    id: AgentId,
    state: RwLock<AgentState>,
    info: RwLock<AgentInfo>,
    transport: RwLock<TransportHandle>,
    last_heartbeat: RwLock<Instant>,
    heartbeat_interval: RwLock<Duration>,
    heartbeat_jitter: RwLock<Duration>,
}

impl Agent {
    pub fn new(id: AgentId, transport: TransportHandle) -> Self {
        Self {
            id,
            state: RwLock::new(AgentState::New),
            info: RwLock::new(AgentInfo::default()),
            transport: RwLock::new(transport),
            last_heartbeat: RwLock::new(Instant::now()),
            heartbeat_interval: RwLock::new(DEFAULT_HEARTBEAT_INTERVAL),
            heartbeat_jitter: RwLock::new(DEFAULT_HEARTBEAT_JITTER),
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn state(&self) -> AgentState {
        *self.state.read().unwrap()
    }

    pub fn transition(&self, next: AgentState) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if !state.can_transition_to(next) {
            return Err(Error::protocol(format!(
                "invalid agent state transition {:?} -> {:?}",
                *state, next
            )));
        }
        *state = next;
        Ok(())
    }

    pub fn info(&self) -> AgentInfo {
        self.info.read().unwrap().clone()
    }

    pub fn update_info(&self, info: AgentInfo) {
        *self.info.write().unwrap() = info;
    }

    pub fn transport(&self) -> TransportHandle {
        self.transport.read().unwrap().clone()
    }

    pub fn switch_transport(&self, transport: TransportHandle) {
        *self.transport.write().unwrap() = transport;
    }

    /// Records a heartbeat, reviving an `Inactive` agent back to `Active`.
    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.write().unwrap() = Instant::now();
        let mut state = self.state.write().unwrap();
        if *state == AgentState::Inactive {
            *state = AgentState::Active;
        }
    }

    /// Replaces this agent's heartbeat cadence, typically from its
    /// registration payload. Bounds are validated by the caller
    /// ([`super::registry::SessionRegistry::set_heartbeat`]).
    pub fn set_heartbeat(&self, interval: Duration, jitter: Duration) {
        *self.heartbeat_interval.write().unwrap() = interval;
        *self.heartbeat_jitter.write().unwrap() = jitter;
    }

    pub fn heartbeat_interval(&self) -> Duration {
        *self.heartbeat_interval.read().unwrap()
    }

    pub fn heartbeat_jitter(&self) -> Duration {
        *self.heartbeat_jitter.read().unwrap()
    }

    /// An agent has timed out once it's gone quiet for longer than its own
    /// interval plus jitter allowance.
    pub fn is_timed_out(&self) -> bool {
        let elapsed = self.last_heartbeat.read().unwrap().elapsed();
        elapsed > self.heartbeat_interval() + self.heartbeat_jitter()
    }

    pub fn last_heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.read().unwrap().elapsed()
    }
}
