//! UDP broadcast discovery: announce our presence and track peers we hear.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub const DEFAULT_DISCOVERY_PORT: u16 = 48391;
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);
const PEER_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Announcement {
    node_id: String,
    tcp_port: u16,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: String,
    pub addr: SocketAddr,
    pub roles: Vec<String>,
    pub last_seen: Instant,
}

type PeerSeenFn = Arc<dyn Fn(&PeerInfo) + Send + Sync>;
type PeerLostFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Broadcasts our presence on the LAN and tracks the peers we hear from.
pub struct Discovery {
    socket: UdpSocket,
    node_id: String,
    tcp_port: u16,
    roles: Vec<String>,
    broadcast_addr: SocketAddrV4,
    peers: RwLock<HashMap<String, PeerInfo>>,
    peer_seen_fn: RwLock<Option<PeerSeenFn>>,
    peer_lost_fn: RwLock<Option<PeerLostFn>>,
}

impl Discovery {
    pub async fn bind(node_id: impl Into<String>, tcp_port: u16, roles: Vec<String>, port: u16) -> Result<Arc<Self>, DiscoveryError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port).into())?;

        let socket = UdpSocket::from_std(socket.into())?;

        Ok(Arc::new(Self {
            socket,
            node_id: node_id.into(),
            tcp_port,
            roles,
            broadcast_addr: SocketAddrV4::new(std::net::Ipv4Addr::new(255, 255, 255, 255), port),
            peers: RwLock::new(HashMap::new()),
            peer_seen_fn: RwLock::new(None),
            peer_lost_fn: RwLock::new(None),
        }))
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_addr(&self, node_id: &str) -> Option<SocketAddr> {
        self.peers.read().get(node_id).map(|p| p.addr)
    }

    /// Fired synchronously from the listener whenever a beacon is heard,
    /// whether the peer is new or already known.
    pub fn on_peer_seen(&self, f: impl Fn(&PeerInfo) + Send + Sync + 'static) {
        *self.peer_seen_fn.write() = Some(Arc::new(f));
    }

    /// Fired synchronously from the prune sweep when a peer times out.
    pub fn on_peer_lost(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        *self.peer_lost_fn.write() = Some(Arc::new(f));
    }

    /// Periodically announce our presence. Runs until the task is dropped.
    pub async fn run_announcer(self: Arc<Self>) {
        let announcement = Announcement { node_id: self.node_id.clone(), tcp_port: self.tcp_port, roles: self.roles.clone() };
        let Ok(body) = serde_json::to_vec(&announcement) else { return };
        loop {
            if let Err(e) = self.socket.send_to(&body, self.broadcast_addr).await {
                warn!(error = %e, "discovery broadcast failed");
            }
            tokio::time::sleep(ANNOUNCE_INTERVAL).await;
        }
    }

    /// Receive loop: updates the peer table as announcements arrive.
    pub async fn run_listener(self: Arc<Self>) {
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "discovery recv failed");
                    continue;
                }
            };
            let Ok(announcement) = serde_json::from_slice::<Announcement>(&buf[..len]) else {
                continue;
            };
            if announcement.node_id == self.node_id {
                continue;
            }
            let peer_addr = SocketAddr::new(addr.ip(), announcement.tcp_port);
            debug!(peer = %announcement.node_id, addr = %peer_addr, "discovered peer");
            let peer = PeerInfo { node_id: announcement.node_id, addr: peer_addr, roles: announcement.roles, last_seen: Instant::now() };
            self.peers.write().insert(peer.node_id.clone(), peer.clone());

            if let Some(f) = self.peer_seen_fn.read().clone() {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&peer))).is_err() {
                    warn!(peer = %peer.node_id, "peer-seen handler panicked");
                }
            }
        }
    }

    /// Drop peers we haven't heard from recently. Intended to run on a timer
    /// alongside the listener/announcer tasks.
    pub fn prune_stale(&self) {
        let cutoff = Instant::now() - PEER_TIMEOUT;
        let lost: Vec<String> = {
            let mut peers = self.peers.write();
            let lost = peers.iter().filter(|(_, p)| p.last_seen < cutoff).map(|(id, _)| id.clone()).collect();
            peers.retain(|_, p| p.last_seen >= cutoff);
            lost
        };
        if lost.is_empty() {
            return;
        }
        let Some(f) = self.peer_lost_fn.read().clone() else { return };
        for node_id in lost {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&node_id))).is_err() {
                warn!(peer = %node_id, "peer-lost handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prune_stale_drops_timed_out_peers_and_fires_the_lost_callback() {
        let discovery = Discovery::bind("hub", 7711, vec!["sensor".to_string()], 0).await.unwrap();
        let lost: Arc<RwLock<Vec<String>>> = Arc::new(RwLock::new(Vec::new()));
        let lost_clone = lost.clone();
        discovery.on_peer_lost(move |id: &str| lost_clone.write().push(id.to_string()));

        discovery.peers.write().insert(
            "esp32-01".to_string(),
            PeerInfo {
                node_id: "esp32-01".to_string(),
                addr: "127.0.0.1:9000".parse().unwrap(),
                roles: vec![],
                last_seen: Instant::now() - PEER_TIMEOUT - Duration::from_secs(1),
            },
        );

        discovery.prune_stale();

        assert_eq!(*lost.read(), vec!["esp32-01".to_string()]);
        assert!(discovery.peers().is_empty());
    }

    /// A peer-lost handler that panics must not take down the prune sweep —
    /// the panic is caught, logged, and the sweep finishes normally.
    #[tokio::test]
    async fn a_panicking_peer_lost_handler_does_not_abort_pruning() {
        let discovery = Discovery::bind("hub", 7711, Vec::new(), 0).await.unwrap();
        discovery.on_peer_lost(|_id: &str| panic!("boom"));

        discovery.peers.write().insert(
            "esp32-01".to_string(),
            PeerInfo {
                node_id: "esp32-01".to_string(),
                addr: "127.0.0.1:9000".parse().unwrap(),
                roles: vec![],
                last_seen: Instant::now() - PEER_TIMEOUT - Duration::from_secs(1),
            },
        );

        discovery.prune_stale();
        assert!(discovery.peers().is_empty());
    }
}
