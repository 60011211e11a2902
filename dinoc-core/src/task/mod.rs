//! Task lifecycle: creation, dispatch, completion and timeout sweeping.

pub mod dispatch;
pub mod engine;
pub mod payload;
pub mod task;

pub use dispatch::{decode_dispatch, decode_task_result, encode_dispatch, encode_task_result};
pub use engine::{TaskEngine, DEFAULT_TASK_SWEEP_PERIOD, DEFAULT_TASK_TIMEOUT_SECS};
pub use payload::{ModuleStore, ProtocolSwitchPayload, PROTOCOL_SWITCH_MAGIC};
pub use task::{Task, TaskKind, TaskResult, TaskState};
