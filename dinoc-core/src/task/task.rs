//! A single unit of work dispatched to an agent.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::id::{AgentId, TaskId};
use crate::transport::TransportKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Sent,
    Running,
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::TimedOut | TaskState::Canceled
        )
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Sent)
                | (Sent, Running)
                | (Sent, Completed)
                | (Sent, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Created, Canceled)
                | (Sent, Canceled)
                | (Running, Canceled)
                | (Created, TimedOut)
                | (Sent, TimedOut)
                | (Running, TimedOut)
        )
    }
}

/// What an agent is being asked to do. Payload interpretation beyond what
/// the task engine itself needs (routing, bookkeeping module state) is an
/// agent-side concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    ShellExec { command: String },
    FileDownload { remote_path: String },
    FileUpload { remote_path: String, data: Vec<u8> },
    /// Names a blob previously registered with the server's `ModuleStore`;
    /// the bytes are resolved at dispatch time, not carried here.
    ModuleLoad { name: String },
    ModuleUnload { name: String },
    Configure { key: String, value: String },
    ProtocolSwitch {
        transport: TransportKind,
        port: u16,
        domain: String,
        timeout_ms: u32,
        flags: u8,
    },
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    pub output: Vec<u8>,
}

pub struct Task {
    id: TaskId,
    agent: AgentId,
    kind: TaskKind,
    state: RwLock<TaskState>,
    created_at: Instant,
    timeout: Duration,
    sent_at: RwLock<Option<Instant>>,
    started_at: RwLock<Option<Instant>>,
    finished_at: RwLock<Option<Instant>>,
    error: RwLock<Option<String>>,
    result: RwLock<Option<TaskResult>>,
}

impl Task {
    pub fn new(agent: AgentId, kind: TaskKind, timeout: Duration) -> Self {
        Self {
            id: TaskId::new(),
            agent,
            kind,
            state: RwLock::new(TaskState::Created),
            created_at: Instant::now(),
            timeout,
            sent_at: RwLock::new(None),
            started_at: RwLock::new(None),
            finished_at: RwLock::new(None),
            error: RwLock::new(None),
            result: RwLock::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn state(&self) -> TaskState {
        *self.state.read().unwrap()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sent_at(&self) -> Option<Instant> {
        *self.sent_at.read().unwrap()
    }

    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.read().unwrap()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        *self.finished_at.read().unwrap()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().unwrap().clone()
    }

    pub fn set_error(&self, error: impl Into<String>) {
        *self.error.write().unwrap() = Some(error.into());
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.result.read().unwrap().clone()
    }

    /// A task has timed out once it's been `sent` (or `created`, if never
    /// sent) longer than its own `timeout` allows.
    pub fn is_timed_out(&self) -> bool {
        let base = self.sent_at().unwrap_or(self.created_at);
        base.elapsed() > self.timeout
    }

    pub fn transition(&self, next: TaskState) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if !state.can_transition_to(next) {
            return Err(Error::protocol(format!(
                "invalid task state transition {:?} -> {:?}",
                *state, next
            )));
        }
        *state = next;
        match next {
            TaskState::Sent => *self.sent_at.write().unwrap() = Some(Instant::now()),
            TaskState::Running => *self.started_at.write().unwrap() = Some(Instant::now()),
            _ if next.is_terminal() => *self.finished_at.write().unwrap() = Some(Instant::now()),
            _ => {}
        }
        Ok(())
    }

    pub fn set_result(&self, result: TaskResult) {
        *self.result.write().unwrap() = Some(result);
    }
}
