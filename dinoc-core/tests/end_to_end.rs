//! End-to-end scenarios that exercise the session, task and framing layers
//! together the way `dinoc-server`'s bootstrap glue does, without any real
//! sockets involved.

use std::net::SocketAddr;
use std::time::Duration;

use dinoc_core::frame::aead::{AeadCipher, SessionCipher, KEY_LEN};
use dinoc_core::frame::header::{FrameKind, MAGIC_AES_GCM};
use dinoc_core::frame::{codec, Reassembler};
use dinoc_core::id::{AgentId, ListenerId};
use dinoc_core::session::{RegistrationPayload, SessionRegistry};
use dinoc_core::task::{decode_dispatch, decode_task_result, encode_dispatch, encode_task_result, TaskEngine, TaskKind};
use dinoc_core::transport::{TransportHandle, TransportKind};

fn peer(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn tcp_transport(port: u16) -> TransportHandle {
    TransportHandle::new(TransportKind::Tcp, ListenerId::new(), peer(port))
}

/// A brand new agent registers, completes a shell-exec task, and its result
/// lands back in the engine as `Completed`.
#[test]
fn registration_through_task_completion() {
    let registry = SessionRegistry::new(Duration::from_secs(90), Duration::from_secs(0));
    let tasks = TaskEngine::new();
    let key = [0x11u8; KEY_LEN];

    // Plaintext registration handshake.
    let payload = RegistrationPayload {
        rejoin: None,
        cipher_magic: MAGIC_AES_GCM,
        heartbeat_interval_secs: 30,
        heartbeat_jitter_secs: 5,
        info: dinoc_core::session::agent::AgentInfo {
            hostname: "workstation".into(),
            os: "linux".into(),
            username: "svc".into(),
        },
    };
    let wire = payload.encode();
    let decoded = RegistrationPayload::decode(&wire).unwrap();
    assert!(decoded.rejoin.is_none());

    let pending = registry.register(tcp_transport(4444));
    let agent_id = pending.id();
    registry.complete_registration(agent_id, decoded.info.clone()).unwrap();
    let cipher = SessionCipher::for_magic(decoded.cipher_magic, &key).unwrap();

    // Server dispatches a shell-exec task, sealed as an Application frame.
    let task = tasks.create(agent_id, TaskKind::ShellExec { command: "id".into() }, 300);
    let dispatch_bytes = encode_dispatch(&task, None).unwrap();
    let sealed = codec::encode_outbound(&dispatch_bytes, FrameKind::Application, &cipher, false).unwrap();
    tasks.mark_sent(task.id()).unwrap();

    // Agent receives and "runs" it: decode what the wire carried.
    let (opened, kind) = codec::decode_inbound(&sealed, &cipher).unwrap();
    assert_eq!(kind, FrameKind::Application);
    let (task_id, task_kind) = decode_dispatch(&opened).unwrap();
    assert_eq!(task_id, task.id());
    assert_eq!(task_kind, TaskKind::ShellExec { command: "id".into() });
    tasks.mark_running(task.id()).unwrap();

    // Agent reports the result as a TaskResult frame.
    let result_bytes = encode_task_result(task_id, true, b"uid=0(root)");
    let sealed_result = codec::encode_outbound(&result_bytes, FrameKind::TaskResult, &cipher, false).unwrap();
    let (opened_result, kind) = codec::decode_inbound(&sealed_result, &cipher).unwrap();
    assert_eq!(kind, FrameKind::TaskResult);
    let (result_id, success, output) = decode_task_result(&opened_result).unwrap();
    assert_eq!(result_id, task.id());
    tasks.complete(result_id, output).unwrap();

    let completed = tasks.find(task.id()).unwrap();
    assert!(completed.result().unwrap().success);
    assert_eq!(completed.result().unwrap().output, b"uid=0(root)");
    assert!(success);
}

/// A previously registered agent reconnects over a new transport (the
/// protocol-switch path) and keeps its identity and pending task history.
#[test]
fn rejoin_preserves_identity_across_transport_switch() {
    let registry = SessionRegistry::new(Duration::from_secs(90), Duration::from_secs(0));
    let tasks = TaskEngine::new();

    let agent = registry.register(tcp_transport(4444));
    let id = agent.id();
    registry
        .complete_registration(id, dinoc_core::session::agent::AgentInfo::default())
        .unwrap();
    tasks.create(id, TaskKind::ShellExec { command: "uname -a".into() }, 300);

    // Agent drops TCP and reconnects over WebSocket, naming its old id.
    let rejoin_payload = RegistrationPayload {
        rejoin: Some(id),
        cipher_magic: MAGIC_AES_GCM,
        heartbeat_interval_secs: 30,
        heartbeat_jitter_secs: 0,
        info: dinoc_core::session::agent::AgentInfo::default(),
    };
    let decoded = RegistrationPayload::decode(&rejoin_payload.encode()).unwrap();
    assert_eq!(decoded.rejoin, Some(id));

    let new_transport = TransportHandle::new(TransportKind::Ws, ListenerId::new(), peer(8080));
    registry.switch_protocol(decoded.rejoin.unwrap(), new_transport).unwrap();

    let rehomed = registry.lookup(id).unwrap();
    assert_eq!(rehomed.transport().kind(), TransportKind::Ws);
    // The task created before the switch is still tracked under the same id.
    assert_eq!(tasks.list_for_agent(id).len(), 1);
}

/// A large payload sent over a datagram transport is split into fragments,
/// sealed once as a whole frame, and reassembles correctly even when
/// fragments arrive out of order and a duplicate is replayed.
#[test]
fn fragmented_datagram_transport_round_trip_with_duplicate() {
    let cipher = SessionCipher::aes_gcm(&[0x22u8; KEY_LEN]);
    let reassembler = Reassembler::new();
    let agent = AgentId::new();
    let plaintext = vec![0xABu8; 4096];

    let mut datagrams =
        codec::encode_outbound_fragmented(&plaintext, FrameKind::Application, &cipher, true, 99).unwrap();
    assert!(datagrams.len() > 1);
    datagrams.swap(0, datagrams.len() - 1);
    // Replay the first-processed datagram again; reassembly should ignore it.
    let duplicate = datagrams[0].clone();

    let mut result = None;
    for datagram in &datagrams {
        result = codec::decode_inbound_fragmented(agent, datagram, &cipher, &reassembler).unwrap();
    }
    let (decoded, kind) = result.unwrap();
    assert_eq!(decoded, plaintext);
    assert_eq!(kind, FrameKind::Application);

    // A late duplicate for a fragment_id that's already been fully consumed
    // starts a fresh (never-completing) partial rather than erroring.
    assert!(codec::decode_inbound_fragmented(agent, &duplicate, &cipher, &reassembler)
        .unwrap()
        .is_none());
    assert_eq!(reassembler.in_flight(), 1);
}

/// Heartbeat timeouts and task timeouts sweep independently but both land on
/// the same shutdown-friendly periodic-sweep shape.
#[test]
fn heartbeat_and_task_timeouts_sweep_independently() {
    let registry = SessionRegistry::new(Duration::from_secs(0), Duration::from_secs(0));
    let tasks = TaskEngine::new();

    let agent = registry.register(tcp_transport(4444));
    let id = agent.id();
    registry
        .complete_registration(id, dinoc_core::session::agent::AgentInfo::default())
        .unwrap();
    let task = tasks.create(id, TaskKind::ShellExec { command: "sleep 999".into() }, 0);
    tasks.mark_sent(task.id()).unwrap();

    assert_eq!(registry.sweep_timeouts(), 1);
    assert!(registry.lookup(id).is_err());

    assert_eq!(tasks.sweep_timeouts(), 1);
    assert_eq!(
        tasks.find(task.id()).unwrap().state(),
        dinoc_core::task::TaskState::TimedOut
    );
}
