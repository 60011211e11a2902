//! Agent identity, liveness and the registry that tracks both.

pub mod agent;
pub mod registration;
pub mod registry;

pub use agent::{Agent, AgentInfo, AgentState, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_JITTER};
pub use registration::RegistrationPayload;
pub use registry::{SessionRegistry, DEFAULT_SWEEP_PERIOD};
