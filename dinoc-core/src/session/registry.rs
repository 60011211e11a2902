//! The session registry: tracks every connected agent and sweeps out
//! whoever has gone quiet. Grounded in the same `DashMap`-backed,
//! `Arc`-shared-entry pattern this codebase uses elsewhere for concurrent
//! read-mostly tables, with a periodic sweeper task in place of a
//! size-bounded eviction policy.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::id::AgentId;
use crate::shutdown::Shutdown;
use crate::transport::TransportHandle;

use super::agent::{Agent, AgentInfo, AgentState, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_JITTER};

/// Bounds on what [`SessionRegistry::set_heartbeat`] will accept, mirroring
/// what a registration payload may request.
pub const MIN_HEARTBEAT_INTERVAL_SECS: u64 = 1;
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(10);

pub struct SessionRegistry {
    agents: DashMap<AgentId, Arc<Agent>>,
    default_heartbeat_interval: Duration,
    default_heartbeat_jitter: Duration,
}

impl SessionRegistry {
    pub fn new(default_heartbeat_interval: Duration, default_heartbeat_jitter: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            default_heartbeat_interval,
            default_heartbeat_jitter,
        }
    }

    /// Admits a newly-accepted connection as a fresh agent, before it has
    /// completed the registration handshake.
    pub fn register(&self, transport: TransportHandle) -> Arc<Agent> {
        let id = AgentId::new();
        let agent = Arc::new(Agent::new(id, transport));
        agent.set_heartbeat(self.default_heartbeat_interval, self.default_heartbeat_jitter);
        agent
            .transition(AgentState::Connected)
            .expect("a freshly created agent always accepts Connected");
        self.agents.insert(id, agent.clone());
        info!(agent = %id, "agent connected");
        agent
    }

    /// Sets an agent's heartbeat interval and jitter, validating
    /// `1 <= interval_secs <= 86400` and `jitter_secs <= interval_secs`.
    pub fn set_heartbeat(&self, id: AgentId, interval_secs: u64, jitter_secs: u64) -> Result<()> {
        if !(MIN_HEARTBEAT_INTERVAL_SECS..=MAX_HEARTBEAT_INTERVAL_SECS).contains(&interval_secs) {
            return Err(Error::invalid_argument(format!(
                "heartbeat interval {interval_secs}s outside [{MIN_HEARTBEAT_INTERVAL_SECS}, {MAX_HEARTBEAT_INTERVAL_SECS}]"
            )));
        }
        if jitter_secs > interval_secs {
            return Err(Error::invalid_argument(format!(
                "heartbeat jitter {jitter_secs}s exceeds interval {interval_secs}s"
            )));
        }
        let agent = self.lookup(id)?;
        agent.set_heartbeat(Duration::from_secs(interval_secs), Duration::from_secs(jitter_secs));
        Ok(())
    }

    /// Completes the registration handshake: stores the agent-reported
    /// identity and moves it into `Active`.
    pub fn complete_registration(&self, id: AgentId, info: AgentInfo) -> Result<Arc<Agent>> {
        let agent = self.lookup(id)?;
        agent.update_info(info);
        agent.transition(AgentState::Registered)?;
        agent.transition(AgentState::Active)?;
        agent.touch_heartbeat();
        info!(agent = %id, "agent registered");
        Ok(agent)
    }

    pub fn lookup(&self, id: AgentId) -> Result<Arc<Agent>> {
        self.agents
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("agent {id} not registered")))
    }

    pub fn on_heartbeat(&self, id: AgentId) -> Result<()> {
        let agent = self.lookup(id)?;
        agent.touch_heartbeat();
        Ok(())
    }

    /// Re-homes an agent onto a different transport, used by the
    /// `ProtocolSwitch` task.
    pub fn switch_protocol(&self, id: AgentId, transport: TransportHandle) -> Result<()> {
        let agent = self.lookup(id)?;
        let from = agent.transport().kind();
        agent.switch_transport(transport);
        info!(agent = %id, from = %from, to = %agent.transport().kind(), "agent switched transport");
        Ok(())
    }

    pub fn disconnect(&self, id: AgentId) -> Result<()> {
        let agent = self.lookup(id)?;
        agent.transition(AgentState::Disconnected)?;
        self.agents.remove(&id);
        info!(agent = %id, "agent disconnected");
        Ok(())
    }

    pub fn get_all(&self) -> Vec<Arc<Agent>> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Marks stale `Active` agents `Inactive`, and disconnects anyone past
    /// the full heartbeat timeout. Returns how many were disconnected.
    pub fn sweep_timeouts(&self) -> usize {
        let stale: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|entry| entry.value().is_timed_out())
            .map(|entry| *entry.key())
            .collect();

        let mut disconnected = 0;
        for id in stale {
            if let Some((_, agent)) = self.agents.remove(&id) {
                let _ = agent.transition(AgentState::Disconnected);
                warn!(agent = %id, "agent heartbeat timed out, disconnecting");
                disconnected += 1;
            }
        }

        for entry in self.agents.iter() {
            let agent = entry.value();
            let warn_after = agent.heartbeat_interval() / 3;
            if agent.state() == AgentState::Active && agent.last_heartbeat_elapsed() > warn_after {
                let _ = agent.transition(AgentState::Inactive);
                debug!(agent = %agent.id(), "agent marked inactive pending heartbeat");
            }
        }

        disconnected
    }

    /// Spawns the periodic sweep, cooperatively cancelled by `shutdown`.
    pub fn spawn_heartbeat_sweeper(
        self: Arc<Self>,
        shutdown: Shutdown,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep_timeouts();
                        if evicted > 0 {
                            debug!(count = evicted, "swept timed-out agents");
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        debug!("heartbeat sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_JITTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn dummy_transport() -> TransportHandle {
        TransportHandle::Tcp {
            listener: crate::id::ListenerId::new(),
            peer: "127.0.0.1:5555".parse::<SocketAddr>().unwrap(),
        }
    }

    #[test]
    fn register_then_complete_then_lookup() {
        let registry = SessionRegistry::new(Duration::from_secs(90), Duration::from_secs(0));
        let agent = registry.register(dummy_transport());
        let id = agent.id();
        registry
            .complete_registration(
                id,
                AgentInfo {
                    hostname: "box".into(),
                    os: "linux".into(),
                    username: "root".into(),
                },
            )
            .unwrap();
        let found = registry.lookup(id).unwrap();
        assert_eq!(found.state(), AgentState::Active);
        assert_eq!(found.info().hostname, "box");
    }

    #[test]
    fn lookup_missing_agent_errors() {
        let registry = SessionRegistry::new(Duration::from_secs(90), Duration::from_secs(0));
        assert!(registry.lookup(AgentId::new()).is_err());
    }

    #[test]
    fn sweep_disconnects_expired_agents() {
        let registry = SessionRegistry::new(Duration::from_secs(0), Duration::from_secs(0));
        let agent = registry.register(dummy_transport());
        let id = agent.id();
        assert_eq!(registry.sweep_timeouts(), 1);
        assert!(registry.lookup(id).is_err());
    }

    #[test]
    fn set_heartbeat_validates_bounds() {
        let registry = SessionRegistry::new(Duration::from_secs(90), Duration::from_secs(0));
        let agent = registry.register(dummy_transport());
        let id = agent.id();
        assert!(registry.set_heartbeat(id, 0, 0).is_err());
        assert!(registry.set_heartbeat(id, 86_401, 0).is_err());
        assert!(registry.set_heartbeat(id, 10, 20).is_err());
        registry.set_heartbeat(id, 1, 0).unwrap();
        assert_eq!(agent.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn switch_protocol_rehomes_transport() {
        let registry = SessionRegistry::new(Duration::from_secs(90), Duration::from_secs(0));
        let agent = registry.register(dummy_transport());
        let id = agent.id();
        let new_transport = TransportHandle::Ws {
            listener: crate::id::ListenerId::new(),
            peer: "127.0.0.1:6666".parse::<SocketAddr>().unwrap(),
        };
        registry.switch_protocol(id, new_transport).unwrap();
        assert_eq!(registry.lookup(id).unwrap().transport().kind(), crate::transport::TransportKind::Ws);
    }
}
