//! Dispatch, completion and timeout sweeping for tasks, keyed the same way
//! the session registry keys agents: a `DashMap` of `Arc`-shared entries,
//! plus a periodic sweeper task.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::id::{AgentId, TaskId};
use crate::shutdown::Shutdown;

use super::task::{Task, TaskKind, TaskResult, TaskState};

/// Timeout a task is given when its creator doesn't name one explicitly.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_TASK_SWEEP_PERIOD: Duration = Duration::from_secs(1);

pub struct TaskEngine {
    tasks: DashMap<TaskId, Arc<Task>>,
    by_agent: DashMap<AgentId, Vec<TaskId>>,
}

impl TaskEngine {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            by_agent: DashMap::new(),
        }
    }

    /// Creates a task with its own `timeout_secs`, independent of every
    /// other task's timeout.
    pub fn create(&self, agent: AgentId, kind: TaskKind, timeout_secs: u64) -> Arc<Task> {
        let task = Arc::new(Task::new(agent, kind, Duration::from_secs(timeout_secs)));
        self.tasks.insert(task.id(), task.clone());
        self.by_agent.entry(agent).or_default().push(task.id());
        info!(task = %task.id(), agent = %agent, "task created");
        task
    }

    pub fn find(&self, id: TaskId) -> Result<Arc<Task>> {
        self.tasks
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("task {id} not found")))
    }

    pub fn list_for_agent(&self, agent: AgentId) -> Vec<Arc<Task>> {
        self.by_agent
            .get(&agent)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.tasks.get(id).map(|entry| entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Picks the oldest non-terminal task for an agent to dispatch next, if
    /// any is waiting.
    pub fn dispatch_next(&self, agent: AgentId) -> Option<Arc<Task>> {
        self.list_for_agent(agent)
            .into_iter()
            .find(|task| task.state() == TaskState::Created)
    }

    pub fn mark_sent(&self, id: TaskId) -> Result<()> {
        self.find(id)?.transition(TaskState::Sent)
    }

    pub fn mark_running(&self, id: TaskId) -> Result<()> {
        self.find(id)?.transition(TaskState::Running)
    }

    pub fn complete(&self, id: TaskId, output: Vec<u8>) -> Result<()> {
        let task = self.find(id)?;
        task.set_result(TaskResult { success: true, output });
        task.transition(TaskState::Completed)?;
        info!(task = %id, "task completed");
        Ok(())
    }

    pub fn fail(&self, id: TaskId, output: Vec<u8>) -> Result<()> {
        let task = self.find(id)?;
        task.set_result(TaskResult { success: false, output });
        task.transition(TaskState::Failed)?;
        warn!(task = %id, "task failed");
        Ok(())
    }

    /// Fails a task before it ever reached the agent, recording `error` as
    /// the reason (e.g. a `ModuleLoad` whose name resolves to nothing in the
    /// module store).
    pub fn fail_with_error(&self, id: TaskId, error: impl Into<String>) -> Result<()> {
        let task = self.find(id)?;
        let message = error.into();
        task.set_error(message.clone());
        task.set_result(TaskResult { success: false, output: Vec::new() });
        task.transition(TaskState::Failed)?;
        warn!(task = %id, error = %message, "task failed");
        Ok(())
    }

    pub fn cancel(&self, id: TaskId) -> Result<()> {
        self.find(id)?.transition(TaskState::Canceled)
    }

    /// Marks any non-terminal task whose own timeout has elapsed as
    /// `TimedOut`, recording the mandated `"task timed out"` error. Returns
    /// how many were swept.
    pub fn sweep_timeouts(&self) -> usize {
        let mut count = 0;
        for entry in self.tasks.iter() {
            let task = entry.value();
            if !task.state().is_terminal() && task.is_timed_out() {
                task.set_error("task timed out");
                if task.transition(TaskState::TimedOut).is_ok() {
                    warn!(task = %task.id(), "task timed out");
                    count += 1;
                }
            }
        }
        count
    }

    pub fn spawn_timeout_sweeper(
        self: Arc<Self>,
        shutdown: Shutdown,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = self.sweep_timeouts();
                        if swept > 0 {
                            debug!(count = swept, "swept timed-out tasks");
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        debug!("task timeout sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for TaskEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_dispatch_complete() {
        let engine = TaskEngine::new();
        let agent = AgentId::new();
        let task = engine.create(agent, TaskKind::ShellExec { command: "whoami".into() }, 300);
        let next = engine.dispatch_next(agent).unwrap();
        assert_eq!(next.id(), task.id());
        engine.mark_sent(task.id()).unwrap();
        engine.mark_running(task.id()).unwrap();
        engine.complete(task.id(), b"root".to_vec()).unwrap();
        assert!(engine.find(task.id()).unwrap().result().unwrap().success);
    }

    #[test]
    fn sweep_times_out_stale_tasks() {
        let engine = TaskEngine::new();
        let agent = AgentId::new();
        let task = engine.create(agent, TaskKind::ShellExec { command: "sleep 100".into() }, 0);
        engine.mark_sent(task.id()).unwrap();
        assert_eq!(engine.sweep_timeouts(), 1);
        let swept = engine.find(task.id()).unwrap();
        assert_eq!(swept.state(), TaskState::TimedOut);
        assert_eq!(swept.error().as_deref(), Some("task timed out"));
    }

    #[test]
    fn per_task_timeouts_are_independent() {
        let engine = TaskEngine::new();
        let agent = AgentId::new();
        let patient = engine.create(agent, TaskKind::ShellExec { command: "sleep 1".into() }, 300);
        let impatient = engine.create(agent, TaskKind::ShellExec { command: "sleep 2".into() }, 0);
        engine.mark_sent(patient.id()).unwrap();
        engine.mark_sent(impatient.id()).unwrap();
        assert_eq!(engine.sweep_timeouts(), 1);
        assert_eq!(engine.find(patient.id()).unwrap().state(), TaskState::Sent);
        assert_eq!(engine.find(impatient.id()).unwrap().state(), TaskState::TimedOut);
    }

    #[test]
    fn fail_with_error_records_the_reason() {
        let engine = TaskEngine::new();
        let agent = AgentId::new();
        let task = engine.create(agent, TaskKind::ModuleLoad { name: "ghost".into() }, 300);
        engine.fail_with_error(task.id(), "module not found").unwrap();
        let failed = engine.find(task.id()).unwrap();
        assert_eq!(failed.state(), TaskState::Failed);
        assert_eq!(failed.error().as_deref(), Some("module not found"));
    }

    #[test]
    fn find_missing_task_errors() {
        let engine = TaskEngine::new();
        assert!(engine.find(TaskId::new()).is_err());
    }
}
