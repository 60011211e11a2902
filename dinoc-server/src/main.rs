mod bootstrap;
mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use dinoc_core::listener::dns::DnsListenerAdapter;
use dinoc_core::listener::icmp::IcmpListenerAdapter;
use dinoc_core::listener::tcp::TcpListenerAdapter;
use dinoc_core::listener::udp::UdpListenerAdapter;
use dinoc_core::listener::ws::WsListenerAdapter;
use dinoc_core::listener::{Listener, ListenerConfig};
use dinoc_core::session::SessionRegistry;
use dinoc_core::shutdown::Shutdown;
use dinoc_core::task::TaskEngine;
use dinoc_core::transport::TransportKind;
use tracing::{error, info, warn};

use bootstrap::ServerEvents;
use config::ServerConfig;

#[tokio::main]
async fn main() {
    let args = cli::parse_arguments();
    info!("dinocd v{}", env!("CARGO_PKG_VERSION"));

    let config = match ServerConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            warn!(path = %args.config.display(), error = %err, "failed to load config file, using defaults");
            ServerConfig::default()
        }
    };

    let shared_key_hex = args
        .shared_key
        .clone()
        .or_else(|| config.shared_key_hex.clone())
        .unwrap_or_else(|| {
            error!("no pre-shared AEAD key given: pass --shared-key or set shared_key_hex in the config");
            std::process::exit(1);
        });
    let shared_key = match bootstrap::parse_shared_key(&shared_key_hex) {
        Ok(key) => key,
        Err(err) => {
            error!(error = %err, "invalid pre-shared key");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(SessionRegistry::new(
        Duration::from_secs(config.heartbeat_interval_secs),
        Duration::from_secs(config.heartbeat_jitter_secs),
    ));
    let tasks = Arc::new(TaskEngine::new());
    let events = ServerEvents::new(registry.clone(), tasks.clone(), shared_key);
    let shutdown = Shutdown::new();

    let mut listeners: Vec<Arc<dyn Listener>> = Vec::new();

    if let Some(bind_addr) = config.transports.tcp {
        let listener = TcpListenerAdapter::new(ListenerConfig { bind_addr, kind: TransportKind::Tcp });
        listeners.push(listener);
    }
    if let Some(bind_addr) = config.transports.udp {
        let listener = UdpListenerAdapter::new(ListenerConfig { bind_addr, kind: TransportKind::Udp });
        listeners.push(listener);
    }
    if let Some(bind_addr) = config.transports.ws {
        let listener = WsListenerAdapter::new(ListenerConfig { bind_addr, kind: TransportKind::Ws });
        listeners.push(listener);
    }
    if let Some(bind_addr) = config.transports.icmp {
        let listener = IcmpListenerAdapter::new(ListenerConfig { bind_addr, kind: TransportKind::Icmp });
        listeners.push(listener);
    }
    if let Some(dns) = config.transports.dns.clone() {
        let listener = DnsListenerAdapter::new(ListenerConfig { bind_addr: dns.bind, kind: TransportKind::Dns }, dns.zone);
        listeners.push(listener);
    }

    if listeners.is_empty() {
        warn!("no transports configured, the daemon will accept no agents");
    }

    for listener in &listeners {
        events.register_listener(listener.clone());
    }
    for listener in listeners {
        if let Err(err) = listener.clone().start(events.clone()).await {
            error!(kind = %listener.kind(), error = %err, "failed to start listener");
            std::process::exit(1);
        }
        info!(kind = %listener.kind(), "listener started");
    }

    registry
        .clone()
        .spawn_heartbeat_sweeper(shutdown.clone(), Duration::from_secs(config.heartbeat_sweep_period_secs));
    tasks
        .clone()
        .spawn_timeout_sweeper(shutdown.clone(), Duration::from_secs(config.task_sweep_period_secs));
    spawn_reassembly_sweeper(events.reassembler(), shutdown.clone());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = shutdown.wait_for_shutdown() => {}
    }
    shutdown.shut_down();
    info!("dinocd shutting down");
}

fn spawn_reassembly_sweeper(reassembler: Arc<dinoc_core::frame::Reassembler>, shutdown: Shutdown) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = reassembler.sweep_expired();
                    if evicted > 0 {
                        info!(count = evicted, "swept stale fragment reassemblies");
                    }
                }
                _ = shutdown.wait_for_shutdown() => break,
            }
        }
    });
}
