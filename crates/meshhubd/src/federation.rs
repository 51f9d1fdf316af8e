//! Hub-to-hub federation: persistent links to peer hubs, command
//! forwarding, and state broadcast.

use crate::registry::Registry;
use meshhub_core::command::{validate_command, Action, DeviceCommand};
use meshhub_core::envelope::{Envelope, MsgType};
use meshhub_net::Transport;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{info, warn};

const RECONNECT_BASE_SECS: f64 = 2.0;
const RECONNECT_MAX_SECS: f64 = 60.0;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationPeerConfig {
    pub hub_id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub peers: Vec<FederationPeerConfig>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

fn default_sync_interval() -> u64 {
    30
}

impl FederationConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self { peers: Vec::new(), sync_interval_secs: default_sync_interval() });
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

type PendingKey = (String, String);

/// Coordinates outbound links to every configured peer hub, tracks which
/// peer owns which remote device (from inbound `FEDERATION_SYNC`), answers
/// forwarded-command requests from this hub's own command dispatcher, and
/// executes commands forwarded to us by a peer against our own registry.
pub struct FederationManager {
    node_id: String,
    config: FederationConfig,
    transport: Arc<Transport>,
    registry: Arc<Registry>,
    pending: RwLock<HashMap<PendingKey, oneshot::Sender<Envelope>>>,
    remote_devices: RwLock<HashMap<String, String>>,
}

impl FederationManager {
    pub fn new(node_id: impl Into<String>, config: FederationConfig, transport: Arc<Transport>, registry: Arc<Registry>) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            transport,
            registry,
            pending: RwLock::new(HashMap::new()),
            remote_devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn peers(&self) -> &[FederationPeerConfig] {
        &self.config.peers
    }

    /// Maintains one persistent connection per configured peer, reconnecting
    /// with exponential backoff on failure. Runs until cancelled.
    pub async fn run_links(self: Arc<Self>) {
        let mut tasks = Vec::new();
        for peer in self.config.peers.clone() {
            let this = self.clone();
            tasks.push(tokio::spawn(async move { this.run_link(peer).await }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn run_link(self: Arc<Self>, peer: FederationPeerConfig) {
        let mut backoff = RECONNECT_BASE_SECS;
        loop {
            let addr: SocketAddr = match format!("{}:{}", peer.host, peer.port).parse() {
                Ok(a) => a,
                Err(e) => {
                    warn!(peer = %peer.hub_id, error = %e, "invalid federation peer address");
                    return;
                }
            };

            let (tx, mut rx) = tokio::sync::mpsc::channel(32);
            let connect = self.transport.connect(&peer.hub_id, addr, tx);
            match timeout(CONNECT_TIMEOUT, connect).await {
                Ok(Ok(())) => {
                    info!(peer = %peer.hub_id, "federation link established");
                    backoff = RECONNECT_BASE_SECS;
                    self.send_hello(&peer.hub_id).await;
                    while let Some(event) = rx.recv().await {
                        if let meshhub_net::transport::TransportEvent::Envelope(env) = event {
                            self.handle_envelope(env).await;
                        }
                    }
                }
                Ok(Err(e)) => warn!(peer = %peer.hub_id, error = %e, "federation link failed"),
                Err(_) => warn!(peer = %peer.hub_id, "federation link connect timed out"),
            }

            tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            backoff = (backoff * 2.0).min(RECONNECT_MAX_SECS);
        }
    }

    async fn send_hello(&self, peer_id: &str) {
        let env = Envelope::new(MsgType::FederationHello, self.node_id.clone(), peer_id.to_string());
        let _ = self.transport.send(peer_id, env).await;
    }

    pub async fn ping_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(PING_INTERVAL).await;
            for peer in &self.config.peers {
                let env = Envelope::new(MsgType::FederationPing, self.node_id.clone(), peer.hub_id.clone());
                let _ = self.transport.send(&peer.hub_id, env).await;
            }
        }
    }

    /// Every `sync_interval_secs`, tells each connected peer which devices
    /// this hub currently owns.
    pub async fn sync_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.sync_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            let devices: Vec<String> = self.registry.all().into_iter().map(|d| d.node_id).collect();
            for peer in &self.config.peers {
                if !self.transport.is_connected(&peer.hub_id) {
                    continue;
                }
                let payload = serde_json::json!({ "hub_id": self.node_id, "devices": devices });
                let env = Envelope::new(MsgType::FederationSync, self.node_id.clone(), peer.hub_id.clone()).with_payload(payload);
                let _ = self.transport.send(&peer.hub_id, env).await;
            }
        }
    }

    /// Dispatch an inbound federation envelope by type. Called for every
    /// federation-typed envelope regardless of which side dialed the link —
    /// the accepting hub's shared transport listener routes here too.
    pub(crate) async fn handle_envelope(&self, env: Envelope) {
        match env.msg_type {
            MsgType::FederationPing => {
                let pong = Envelope::new(MsgType::FederationPong, self.node_id.clone(), env.source);
                let target = pong.target.clone();
                let _ = self.transport.send(&target, pong).await;
            }
            MsgType::FederationSync => {
                let owner = env.payload.get("hub_id").and_then(|v| v.as_str()).unwrap_or(&env.source).to_string();
                let devices = env.payload.get("devices").and_then(|v| v.as_array()).cloned().unwrap_or_default();
                let mut remote = self.remote_devices.write();
                for device in devices {
                    if let Some(id) = device.as_str() {
                        remote.insert(id.to_string(), owner.clone());
                    }
                }
            }
            MsgType::FederationCommand => self.execute_forwarded_command(env).await,
            MsgType::FederationResponse => {
                let key = (env.source.clone(), env.payload.get("device").and_then(|v| v.as_str()).unwrap_or_default().to_string());
                if let Some(tx) = self.pending.write().remove(&key) {
                    let _ = tx.send(env);
                }
            }
            _ => {}
        }
    }

    /// Runs a command a peer forwarded to us, then replies with success.
    async fn execute_forwarded_command(&self, env: Envelope) {
        let device = env.payload.get("device").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let capability = env.payload.get("capability").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let value = env.payload.get("value").cloned().unwrap_or(serde_json::Value::Null);

        let mut params = HashMap::new();
        params.insert("value".to_string(), value);
        let cmd = DeviceCommand { device: device.clone(), action: Action::Set, capability, params };

        let device_record = self.registry.get(&device);
        let errors = validate_command(&cmd, device_record.as_ref());
        let success = errors.is_empty();
        if success {
            let envelope = meshhub_core::command::command_to_envelope(&cmd, &self.node_id);
            let _ = self.transport.send(&device, envelope).await;
        } else {
            warn!(device = %device, errors = ?errors, "rejected forwarded command");
        }

        let response = serde_json::json!({ "device": device, "success": success });
        let reply = Envelope::new(MsgType::FederationResponse, self.node_id.clone(), env.source).with_payload(response);
        let target = reply.target.clone();
        let _ = self.transport.send(&target, reply).await;
    }

    /// Forward a command to whichever peer owns `device`, per the latest
    /// `FEDERATION_SYNC` snapshot, and await success/failure up to
    /// `timeout_secs`. An unknown or disconnected owner resolves to `false`
    /// immediately, without sending anything.
    pub async fn forward_command(&self, device: &str, capability: &str, value: serde_json::Value, timeout_secs: f64) -> bool {
        let Some(peer_id) = self.remote_devices.read().get(device).cloned() else {
            return false;
        };
        if !self.transport.is_connected(&peer_id) {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.write().insert((peer_id.clone(), device.to_string()), tx);

        let payload = serde_json::json!({ "device": device, "capability": capability, "value": value });
        let env = Envelope::new(MsgType::FederationCommand, self.node_id.clone(), peer_id.clone()).with_payload(payload);
        if self.transport.send(&peer_id, env).await.is_err() {
            self.pending.write().remove(&(peer_id, device.to_string()));
            return false;
        }

        let wait = Duration::from_secs_f64(timeout_secs.max(0.0));
        match timeout(wait, rx).await {
            Ok(Ok(response)) => response.payload.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
            Ok(Err(_)) => false,
            Err(_) => {
                self.pending.write().remove(&(peer_id, device.to_string()));
                false
            }
        }
    }

    pub async fn broadcast_state_update(&self, payload: serde_json::Value) {
        for peer in &self.config.peers {
            let env = Envelope::new(MsgType::FederationState, self.node_id.clone(), peer.hub_id.clone()).with_payload(payload.clone());
            let _ = self.transport.send(&peer.hub_id, env).await;
        }
    }

    /// Which peer hub, if any, a `FEDERATION_SYNC` snapshot has told us owns
    /// `device_id`.
    pub fn remote_owner(&self, device_id: &str) -> Option<String> {
        self.remote_devices.read().get(device_id).cloned()
    }

    pub fn known_peer_ids(&self) -> Vec<String> {
        self.config.peers.iter().map(|p| p.hub_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> FederationManager {
        let config = FederationConfig {
            peers: vec![FederationPeerConfig { hub_id: "hub-b".into(), host: "127.0.0.1".into(), port: 18800 }],
            sync_interval_secs: 30,
        };
        let transport = Arc::new(Transport::new("127.0.0.1:0".parse().unwrap(), 1 << 20));
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::load(dir.path().join("registry.json")).unwrap());
        FederationManager::new("hub-a", config, transport, registry)
    }

    #[tokio::test]
    async fn forward_command_to_unknown_device_is_immediate_false() {
        let fed = manager();
        let ok = fed.forward_command("dev-b", "speed", serde_json::json!(1500), 2.0).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn forward_command_to_disconnected_owner_is_immediate_false() {
        let fed = manager();
        fed.remote_devices.write().insert("dev-b".to_string(), "hub-b".to_string());
        let ok = fed.forward_command("dev-b", "speed", serde_json::json!(1500), 2.0).await;
        assert!(!ok);
    }

    #[test]
    fn federation_sync_records_remote_device_ownership() {
        let fed = manager();
        let env = Envelope::new(MsgType::FederationSync, "hub-b", "hub-a")
            .with_payload(serde_json::json!({ "hub_id": "hub-b", "devices": ["dev-b", "dev-c"] }));
        tokio::runtime::Runtime::new().unwrap().block_on(fed.handle_envelope(env));
        assert_eq!(fed.remote_devices.read().get("dev-b"), Some(&"hub-b".to_string()));
        assert_eq!(fed.remote_devices.read().get("dev-c"), Some(&"hub-b".to_string()));
    }

    #[test]
    fn forwarded_command_against_a_valid_device_passes_validation() {
        // Mirrors the validation `execute_forwarded_command` runs before
        // replying `{"device": ..., "success": true}` to the owning peer.
        let mut device = meshhub_core::device::Device::new("dev-b", "fan");
        device.online = true;
        device.capabilities.push(meshhub_core::device::Capability {
            name: "speed".to_string(),
            cap_type: meshhub_core::device::CapabilityKind::Actuator,
            data_type: meshhub_core::device::ValueType::Int,
            ..Default::default()
        });

        let mut params = HashMap::new();
        params.insert("value".to_string(), serde_json::json!(1500));
        let cmd = DeviceCommand { device: "dev-b".to_string(), action: Action::Set, capability: "speed".to_string(), params };

        assert!(validate_command(&cmd, Some(&device)).is_empty());
    }
}
