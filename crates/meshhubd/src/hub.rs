//! Hub — wires every mesh subsystem together and drives the inbound
//! envelope dispatch loop.

use crate::automation::AutomationEngine;
use crate::config::Config;
use crate::federation::{FederationConfig, FederationManager};
use crate::groups::GroupManager;
use crate::ota::{FirmwareStore, OtaManager};
use crate::pipeline::SensorPipeline;
use crate::registry::Registry;
use crate::resilience::Watchdog;
use meshhub_core::command::command_to_envelope;
use meshhub_core::envelope::{Envelope, MsgType, BROADCAST_TARGET};
use meshhub_net::transport::{build_mtls, TransportEvent};
use meshhub_net::discovery::PeerInfo;
use meshhub_net::{Discovery, EnrollmentService, KeyStore, MeshCa, Transport};
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] meshhub_net::transport::TransportError),
    #[error("setup error: {0}")]
    Setup(String),
}

/// Owns every mesh subsystem and dispatches inbound envelopes between them.
pub struct Hub {
    config: Config,
    node_id: String,
    key_store: Option<Arc<KeyStore>>,
    discovery: Arc<Discovery>,
    transport: Arc<Transport>,
    enrollment: Option<Arc<EnrollmentService>>,
    registry: Arc<Registry>,
    automation: Arc<AutomationEngine>,
    ota: Arc<OtaManager>,
    groups: Arc<GroupManager>,
    federation: Option<Arc<FederationManager>>,
    pipeline: Arc<SensorPipeline>,
    ca: Option<Arc<MeshCa>>,
    shutdown_tx: broadcast::Sender<()>,
    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

impl Hub {
    pub async fn new(config: Config) -> Result<Self, HubError> {
        config.validate().map_err(|e| HubError::Setup(e.to_string()))?;
        std::fs::create_dir_all(&config.data_dir)?;

        let node_id = config.node_id.clone();

        let key_store = if config.psk_auth_enabled {
            Some(Arc::new(
                KeyStore::with_window(config.keystore_path(), config.nonce_window_secs as f64)
                    .map_err(|e| HubError::Setup(e.to_string()))?,
            ))
        } else {
            None
        };

        let ca = if config.mtls_enabled {
            Some(
                MeshCa::load_or_create(
                    &config.ca_dir.join("root.crt"),
                    &config.ca_dir.join("root.key"),
                    config.ca_dir.join("revoked.json"),
                )
                .map_err(|e| HubError::Setup(e.to_string()))?,
            )
        } else {
            None
        };

        let mut transport = Transport::new(config.listen, 16 * 1024 * 1024);

        if let Some(ca) = &ca {
            let issued = ca.issue(&node_id).map_err(|e| HubError::Setup(e.to_string()))?;
            let (acceptor, connector) = build_mtls(ca.root_cert_pem(), &issued.cert_pem, &issued.key_pem)
                .map_err(|e| HubError::Setup(e.to_string()))?;
            transport = transport.with_tls(acceptor, connector);
        }
        let transport = Arc::new(transport);

        let ca = ca.map(Arc::new);
        if let Some(ca) = &ca {
            let ca = ca.clone();
            *transport.revocation_check_fn.write() = Some(Arc::new(move |id: &str| ca.is_revoked(id)));
        }

        let discovery = Discovery::bind(node_id.clone(), config.listen.port(), config.roles.clone(), config.discovery_port)
            .await
            .map_err(|e| HubError::Setup(e.to_string()))?;

        let enrollment = if config.psk_auth_enabled && key_store.is_some() {
            Some(Arc::new(EnrollmentService::with_limits(
                Duration::from_secs(config.enrollment_timeout_secs),
                config.enrollment_max_attempts,
            )))
        } else {
            None
        };

        let registry = Arc::new(Registry::load(config.registry_path()).map_err(|e| HubError::Setup(e.to_string()))?);

        let discovery_registry = registry.clone();
        discovery.on_peer_seen(move |peer: &PeerInfo| on_discovery_peer_seen(&discovery_registry, peer));
        let discovery_registry = registry.clone();
        discovery.on_peer_lost(move |node_id: &str| on_discovery_peer_lost(&discovery_registry, node_id));

        let automation = AutomationEngine::new(config.rules_path());
        automation.load().map_err(|e| HubError::Setup(e.to_string()))?;
        let automation = Arc::new(automation);

        let firmware_store =
            FirmwareStore::new(config.firmware_dir.clone()).map_err(|e| HubError::Setup(e.to_string()))?;
        let ota = Arc::new(OtaManager::new(firmware_store, config.ota_chunk_size));

        let groups = Arc::new(
            GroupManager::load(config.groups_path.clone(), config.scenes_path.clone())
                .map_err(|e| HubError::Setup(e.to_string()))?,
        );

        let federation = if let Some(fed_path) = &config.federation_config {
            let fed_config = FederationConfig::load(fed_path).map_err(|e| HubError::Setup(e.to_string()))?;
            Some(Arc::new(FederationManager::new(node_id.clone(), fed_config, transport.clone(), registry.clone())))
        } else {
            None
        };

        let pipeline = Arc::new(
            SensorPipeline::load(config.sensor_data_path(), config.pipeline_buffer_capacity)
                .map_err(|e| HubError::Setup(e.to_string()))?,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        Ok(Self {
            config,
            node_id,
            key_store,
            discovery,
            transport,
            enrollment,
            registry,
            automation,
            ota,
            groups,
            federation,
            pipeline,
            ca,
            shutdown_tx,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    /// Takes ownership of the stream of decoded chat/command envelopes
    /// arriving from devices, for a caller outside this workspace (e.g. an
    /// LLM agent) to consume. Returns `None` on every call after the first.
    pub fn take_inbound_messages(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inbound_rx.lock().take()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Revoke a device's mesh certificate, closing its transport connection
    /// on its next envelope. No-op (but an error) when mTLS isn't enabled.
    pub fn revoke_device(&self, node_id: &str) -> anyhow::Result<()> {
        let ca = self.ca.as_ref().ok_or_else(|| anyhow::anyhow!("certificate revocation requires mtls_enabled"))?;
        ca.revoke(node_id)?;
        Ok(())
    }

    /// Every device certificate this hub's CA has issued, each flagged
    /// revoked or not. Empty when mTLS isn't enabled.
    pub fn list_device_certs(&self) -> Vec<meshhub_net::ca::DeviceCertEntry> {
        self.ca.as_ref().map(|ca| ca.list_device_certs()).unwrap_or_default()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn automation(&self) -> &Arc<AutomationEngine> {
        &self.automation
    }

    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }

    pub fn ota(&self) -> &Arc<OtaManager> {
        &self.ota
    }

    pub fn pipeline(&self) -> &Arc<SensorPipeline> {
        &self.pipeline
    }

    /// Generates an enrollment PIN for `node_id`, to be displayed to the
    /// operator out of band (e.g. printed on a device's setup screen).
    pub fn begin_enrollment(&self, node_id: &str) -> Option<String> {
        self.enrollment.as_ref().map(|e| e.begin(node_id))
    }

    /// Starts discovery, the inbound transport listener, federation links,
    /// and every background watchdog, then blocks until shutdown.
    pub async fn run(&self) -> Result<(), HubError> {
        info!(node_id = %self.node_id, listen = %self.config.listen, "starting mesh hub");

        let (event_tx, mut event_rx) = mpsc::channel(256);
        let listener_transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = listener_transport.run_listener(event_tx).await {
                warn!(error = %e, "transport listener exited");
            }
        });

        tokio::spawn(self.discovery.clone().run_announcer());
        tokio::spawn(self.discovery.clone().run_listener());

        if let Some(federation) = &self.federation {
            tokio::spawn(federation.clone().run_links());
            tokio::spawn(federation.clone().ping_loop());
            tokio::spawn(federation.clone().sync_loop());
        }

        let mut flush_watchdog = Watchdog::new("pipeline-flush", Duration::from_secs(self.config.pipeline_flush_interval_secs));
        let pipeline = self.pipeline.clone();
        flush_watchdog.start(self.shutdown_tx.subscribe(), move || {
            let pipeline = pipeline.clone();
            async move { pipeline.flush() }
        });

        let mut prune_watchdog = Watchdog::new("peer-prune", Duration::from_secs(30));
        let discovery = self.discovery.clone();
        prune_watchdog.start(self.shutdown_tx.subscribe(), move || {
            let discovery = discovery.clone();
            async move {
                discovery.prune_stale();
                Ok(())
            }
        });

        let mut ota_watchdog = Watchdog::new("ota-timeouts", Duration::from_secs(10));
        let ota = self.ota.clone();
        ota_watchdog.start(self.shutdown_tx.subscribe(), move || {
            let ota = ota.clone();
            async move {
                ota.check_timeouts();
                ota.cleanup_completed();
                Ok(())
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    match event {
                        TransportEvent::Envelope(env) => {
                            if let Err(e) = self.handle_envelope(env).await {
                                warn!(error = %e, "error handling inbound envelope");
                            }
                        }
                        TransportEvent::Connected(peer) => debug!(peer = %peer, "peer connected"),
                        TransportEvent::Disconnected(peer) => debug!(peer = %peer, "peer disconnected"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("hub shutting down");
                    break;
                }
            }
        }

        flush_watchdog.stop();
        prune_watchdog.stop();
        ota_watchdog.stop();
        self.pipeline.flush().ok();
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Route one inbound envelope to the subsystem that owns its type.
    ///
    /// When mTLS isn't carrying identity, every envelope must pass PSK HMAC
    /// + replay-window verification before dispatch, with one exception:
    /// an `ENROLL_REQUEST` is let through unsigned only while that device
    /// has an active pairing PIN, since it doesn't have a PSK yet.
    async fn handle_envelope(&self, mut env: Envelope) -> anyhow::Result<()> {
        if !self.config.mtls_enabled {
            if let Some(key_store) = &self.key_store {
                if env.msg_type == MsgType::EnrollRequest {
                    let active = self.enrollment.as_ref().is_some_and(|e| e.has_active_pin(&env.source));
                    if !active {
                        debug!(source = %env.source, "dropping enroll request outside an active enrollment window");
                        return Ok(());
                    }
                } else {
                    let now = meshhub_net::keystore::now_secs();
                    if let Err(e) = key_store.verify(&env, now) {
                        warn!(source = %env.source, error = %e, "dropping envelope that failed auth");
                        return Ok(());
                    }
                    if let Some(psk) = key_store.psk(&env.source) {
                        if let Err(e) = decrypt_payload(&mut env, &psk) {
                            warn!(source = %env.source, error = %e, "dropping envelope that failed to decrypt");
                            return Ok(());
                        }
                    }
                }
            }
        }

        match env.msg_type {
            MsgType::EnrollRequest => self.handle_enroll_request(env).await?,
            MsgType::StateReport => self.handle_state_report(env).await?,
            MsgType::OtaAccept | MsgType::OtaReject | MsgType::OtaChunkAck | MsgType::OtaVerify | MsgType::OtaAbort => {
                self.handle_ota_event(env).await?
            }
            MsgType::Ping => {
                let pong = Envelope::new(MsgType::Pong, self.node_id.clone(), env.source.clone());
                self.send_signed(&env.source, pong).await?;
            }
            MsgType::Chat | MsgType::Command => {
                let source = env.source.clone();
                if self.inbound_tx.try_send(env).is_err() {
                    warn!(source = %source, "inbound message stream full or has no consumer, dropping message");
                }
            }
            MsgType::FederationHello
            | MsgType::FederationSync
            | MsgType::FederationPing
            | MsgType::FederationPong
            | MsgType::FederationCommand
            | MsgType::FederationResponse
            | MsgType::FederationState => {
                if let Some(federation) = &self.federation {
                    federation.handle_envelope(env).await;
                } else {
                    debug!(source = %env.source, "federation envelope received but federation is disabled");
                }
            }
            MsgType::Response | MsgType::Pong => {
                debug!(source = %env.source, "response received");
            }
            _ => {
                debug!(msg_type = ?env.msg_type, source = %env.source, "unhandled envelope type");
            }
        }
        Ok(())
    }

    /// Drives the OTA state machine forward in response to a device's
    /// accept/reject/chunk-ack/verify/abort message, sending the next chunk
    /// or a completion envelope as appropriate.
    async fn handle_ota_event(&self, env: Envelope) -> anyhow::Result<()> {
        let device = env.source.clone();
        match env.msg_type {
            MsgType::OtaAccept => {
                self.ota.on_accept(&device)?;
                self.send_next_ota_chunk(&device).await?;
            }
            MsgType::OtaReject => {
                self.ota.on_reject(&device)?;
            }
            MsgType::OtaChunkAck => {
                let Some(index) = env.payload.get("chunk_index").and_then(|v| v.as_u64()) else { return Ok(()) };
                let done = self.ota.on_chunk_ack(&device, index as u32)?;
                if done {
                    let envelope = Envelope::new(MsgType::OtaVerify, self.node_id.clone(), device.clone());
                    self.send_signed(&device, envelope).await?;
                } else {
                    self.send_next_ota_chunk(&device).await?;
                }
            }
            MsgType::OtaVerify => {
                let sha = env.payload.get("sha256").and_then(|v| v.as_str()).unwrap_or_default();
                let verified = self.ota.on_verify(&device, sha)?;
                let msg_type = if verified { MsgType::OtaComplete } else { MsgType::OtaAbort };
                let envelope = Envelope::new(msg_type, self.node_id.clone(), device.clone());
                self.send_signed(&device, envelope).await?;
            }
            MsgType::OtaAbort => {
                self.ota.on_device_abort(&device)?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn send_next_ota_chunk(&self, device: &str) -> anyhow::Result<()> {
        use base64::Engine;
        let (index, data) = self.ota.next_chunk(device)?;
        let payload = serde_json::json!({
            "chunk_index": index,
            "data": base64::engine::general_purpose::STANDARD.encode(data),
        });
        let envelope = Envelope::new(MsgType::OtaChunk, self.node_id.clone(), device.to_string()).with_payload(payload);
        self.send_signed(device, envelope).await
    }

    /// Sends one envelope, PSK-signing it first unless mTLS already carries
    /// channel security or the device has no PSK yet (enrollment replies,
    /// which hand over the PSK itself, are never signed). Eligible unicast
    /// traffic (chat/command/response) to a device with a known PSK is
    /// encrypted before it's signed.
    async fn send_signed(&self, target: &str, mut env: Envelope) -> anyhow::Result<()> {
        if !self.config.mtls_enabled {
            if let Some(key_store) = &self.key_store {
                if self.config.encryption_enabled && env.is_encryptable() {
                    if let Some(psk) = key_store.psk(target) {
                        encrypt_payload(&mut env, &psk)?;
                    }
                }
                if env.msg_type != MsgType::EnrollResponse && key_store.contains(target) {
                    key_store.sign(&mut env)?;
                }
            }
        }
        self.transport.send(target, env).await?;
        Ok(())
    }

    async fn handle_enroll_request(&self, env: Envelope) -> anyhow::Result<()> {
        let (Some(enrollment), Some(key_store)) = (&self.enrollment, &self.key_store) else {
            return Ok(());
        };
        let Some(pin_proof) = env.payload.get("pin_proof").and_then(|v| v.as_str()) else {
            warn!(device = %env.source, "enroll request missing pin_proof");
            return Ok(());
        };

        let mut psk = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut psk);

        let mut outcome = enrollment.handle_request(&env.source, pin_proof, &psk);
        let succeeded = outcome.psk.is_some();

        if succeeded && self.config.mtls_enabled {
            let ca = self.ca.as_ref().expect("ca is built whenever mtls_enabled is set");
            if let Err(e) = attach_device_certificate(ca, &env.source, &mut outcome.envelope) {
                warn!(device = %env.source, error = %e, "failed to issue device certificate on enrollment");
            }
        }

        self.send_signed(&env.source, outcome.envelope).await?;
        if let Some(psk) = outcome.psk {
            key_store.insert(env.source.clone(), psk.to_vec(), meshhub_net::keystore::now_secs().to_string())?;
        }
        if succeeded {
            info!(device = %env.source, "device enrolled");
        } else {
            warn!(device = %env.source, "enrollment rejected");
        }
        Ok(())
    }

    async fn handle_state_report(&self, env: Envelope) -> anyhow::Result<()> {
        let Some(state) = env.payload.get("state").cloned() else {
            debug!(source = %env.source, "empty state report");
            return Ok(());
        };

        if let serde_json::Value::Object(map) = &state {
            for (capability, value) in map {
                if let Some(num) = value.as_f64() {
                    self.pipeline.record(&env.source, capability, num, env.ts);
                }
            }
        }

        let state_map: std::collections::HashMap<String, serde_json::Value> = match state {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => std::collections::HashMap::new(),
        };

        let updated = self.registry.update_state(&env.source, state_map)?;
        if !updated {
            warn!(device = %env.source, "state report from unregistered device");
            return Ok(());
        }

        let now = meshhub_net::keystore::now_secs();
        let commands = self.automation.evaluate(&env.source, &self.registry, now);
        for cmd in commands {
            let envelope = command_to_envelope(&cmd, &self.node_id);
            if let Err(e) = self.send_signed(&cmd.device, envelope).await {
                warn!(device = %cmd.device, error = %e, "automation dispatch failed");
            }
        }

        if let Some(federation) = &self.federation {
            federation.broadcast_state_update(env.payload.clone()).await;
        }

        Ok(())
    }

    pub async fn dispatch(&self, env: Envelope) -> anyhow::Result<()> {
        if env.target == BROADCAST_TARGET {
            self.transport.broadcast(env).await;
        } else {
            let target = env.target.clone();
            self.send_signed(&target, env).await?;
        }
        Ok(())
    }

    /// Executes one command via the standard pipeline: validate against the
    /// local registry, send locally if the device lives here, otherwise
    /// forward to whichever peer hub owns it. Returns `false` if the
    /// command is invalid locally and the device isn't a known remote one.
    pub async fn execute_command(&self, cmd: meshhub_core::command::DeviceCommand) -> bool {
        if let Some(device) = self.registry.get(&cmd.device) {
            let errors = meshhub_core::command::validate_command(&cmd, Some(&device));
            if !errors.is_empty() {
                warn!(device = %cmd.device, errors = ?errors, "rejected command");
                return false;
            }
            let envelope = command_to_envelope(&cmd, &self.node_id);
            return self.send_signed(&cmd.device, envelope).await.is_ok();
        }

        if let Some(federation) = &self.federation {
            let value = cmd.params.get("value").cloned().unwrap_or(serde_json::Value::Null);
            return federation.forward_command(&cmd.device, &cmd.capability, value, 2.0).await;
        }

        warn!(device = %cmd.device, "command targets unknown device");
        false
    }
}

/// Registered against [`Discovery::on_peer_seen`]. A beacon only ever
/// carries a node id, address, and role tags, so auto-registering a
/// never-seen device has no capability/type hints to offer; an
/// already-registered device is just marked back online.
fn on_discovery_peer_seen(registry: &Registry, peer: &PeerInfo) {
    if registry.get(&peer.node_id).is_some() {
        if let Err(e) = registry.mark_online(&peer.node_id) {
            warn!(peer = %peer.node_id, error = %e, "failed to mark discovered peer online");
        }
        return;
    }
    let mut device = meshhub_core::device::Device::new(peer.node_id.clone(), "unknown");
    device.metadata.insert("roles".to_string(), serde_json::json!(peer.roles));
    if let Err(e) = registry.register(device) {
        warn!(peer = %peer.node_id, error = %e, "failed to auto-register discovered peer");
    }
}

/// Registered against [`Discovery::on_peer_lost`].
fn on_discovery_peer_lost(registry: &Registry, node_id: &str) {
    if let Err(e) = registry.mark_offline(node_id) {
        warn!(peer = %node_id, error = %e, "failed to mark lost peer offline");
    }
}

fn msg_type_tag(msg_type: MsgType) -> String {
    serde_json::to_value(msg_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Issues a device certificate from `ca` and merges it into an
/// `EnrollResponse`'s success payload, alongside the CA root cert, so an
/// mTLS-enrolling device gets everything it needs to dial back in over TLS.
fn attach_device_certificate(ca: &MeshCa, node_id: &str, envelope: &mut Envelope) -> anyhow::Result<()> {
    let issued = ca.issue(node_id)?;
    let serde_json::Value::Object(payload) = &mut envelope.payload else {
        anyhow::bail!("enroll response payload is not an object");
    };
    payload.insert("ca_cert_pem".to_string(), serde_json::json!(ca.root_cert_pem()));
    payload.insert("cert_pem".to_string(), serde_json::json!(issued.cert_pem));
    payload.insert("key_pem".to_string(), serde_json::json!(issued.key_pem));
    Ok(())
}

/// Encrypts `env.payload` in place under the given PSK (encrypt-then-MAC:
/// called before [`KeyStore::sign`]), clearing the plaintext payload and
/// populating `encrypted_payload`/`iv`. No-op if the envelope type isn't
/// eligible — callers already check [`Envelope::is_encryptable`].
fn encrypt_payload(env: &mut Envelope, psk: &[u8]) -> anyhow::Result<()> {
    let key = meshhub_core::crypto::derive_encrypt_key(psk)?;
    let aad = meshhub_core::crypto::build_aad(&msg_type_tag(env.msg_type), &env.source, &env.target, env.ts);
    let plaintext = serde_json::to_vec(&env.payload)?;
    let (ciphertext, iv) = meshhub_core::crypto::encrypt(&key, &plaintext, &aad)?;
    env.encrypted_payload = Some(hex::encode(ciphertext));
    env.iv = Some(hex::encode(iv));
    env.payload = serde_json::Value::Null;
    Ok(())
}

/// Reverses [`encrypt_payload`]. A no-op if the envelope carries no
/// ciphertext (plaintext envelopes are valid whenever encryption is
/// disabled or the type isn't eligible).
fn decrypt_payload(env: &mut Envelope, psk: &[u8]) -> anyhow::Result<()> {
    let (Some(ct_hex), Some(iv_hex)) = (env.encrypted_payload.as_deref(), env.iv.as_deref()) else {
        return Ok(());
    };
    let key = meshhub_core::crypto::derive_encrypt_key(psk)?;
    let aad = meshhub_core::crypto::build_aad(&msg_type_tag(env.msg_type), &env.source, &env.target, env.ts);
    let ciphertext = hex::decode(ct_hex)?;
    let iv: [u8; 12] = hex::decode(iv_hex)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("encrypted envelope iv must be 12 bytes"))?;
    let plaintext = meshhub_core::crypto::decrypt(&key, &ciphertext, &aad, &iv)?;
    env.payload = serde_json::from_slice(&plaintext)?;
    env.encrypted_payload = None;
    env.iv = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn test_config() -> Config {
        let dir = tempdir().unwrap();
        Config {
            node_id: "hub".to_string(),
            listen: "127.0.0.1:0".parse().unwrap(),
            discovery_port: 0,
            roles: Vec::new(),
            data_dir: dir.into_path(),
            psk_auth_enabled: true,
            allow_unauthenticated: false,
            nonce_window_secs: 30,
            encryption_enabled: true,
            enrollment_pin_length: 6,
            enrollment_timeout_secs: 300,
            enrollment_max_attempts: 3,
            mtls_enabled: false,
            ca_dir: PathBuf::from("unused"),
            device_cert_validity_days: 365,
            firmware_dir: tempdir().unwrap().into_path(),
            ota_chunk_size: 4096,
            ota_timeout_secs: 60,
            groups_path: tempdir().unwrap().path().join("groups.json"),
            scenes_path: tempdir().unwrap().path().join("scenes.json"),
            federation_config: None,
            pipeline_buffer_capacity: 1000,
            pipeline_flush_interval_secs: 60,
            verbose: false,
            log_format: "pretty".to_string(),
        }
    }

    #[tokio::test]
    async fn hub_starts_with_every_subsystem_wired() {
        let hub = Hub::new(test_config()).await.unwrap();
        assert_eq!(hub.node_id(), "hub");
        assert!(hub.registry().all().is_empty());
    }

    #[tokio::test]
    async fn execute_command_against_unknown_device_fails() {
        let hub = Hub::new(test_config()).await.unwrap();
        let cmd = meshhub_core::command::DeviceCommand {
            device: "ghost".to_string(),
            action: meshhub_core::command::Action::Get,
            capability: String::new(),
            params: Default::default(),
        };
        assert!(!hub.execute_command(cmd).await);
    }

    #[tokio::test]
    async fn revoke_device_is_reflected_in_the_certificate_list() {
        let mut config = test_config();
        config.mtls_enabled = true;
        let ca_dir = tempdir().unwrap();
        config.ca_dir = ca_dir.path().to_path_buf();

        // A device cert issued against this hub's CA directory before the
        // hub starts is still on the ledger the hub loads at construction.
        let ca = MeshCa::load_or_create(
            &config.ca_dir.join("root.crt"),
            &config.ca_dir.join("root.key"),
            config.ca_dir.join("revoked.json"),
        )
        .unwrap();
        ca.issue("X").unwrap();
        drop(ca);

        let hub = Hub::new(config).await.unwrap();
        assert!(hub.list_device_certs().iter().any(|c| c.node_id == "X" && !c.revoked));

        hub.revoke_device("X").unwrap();

        let certs = hub.list_device_certs();
        assert!(certs.iter().any(|c| c.node_id == "X" && c.revoked));
        // Issuing a fresh cert for another device still works after a
        // revocation — the CA itself isn't disabled by one revoke.
        assert!(certs.iter().any(|c| c.node_id == "hub" && !c.revoked));
    }

    #[test]
    fn encrypt_then_decrypt_round_trips_and_clears_plaintext() {
        let psk = vec![7u8; 32];
        let mut env = Envelope::new(MsgType::Command, "hub", "esp32-01")
            .with_payload(serde_json::json!({"action": "set", "capability": "speed", "value": 3}));
        let original_payload = env.payload.clone();

        encrypt_payload(&mut env, &psk).unwrap();
        assert_eq!(env.payload, serde_json::Value::Null);
        assert!(env.encrypted_payload.is_some());
        assert!(env.iv.is_some());

        decrypt_payload(&mut env, &psk).unwrap();
        assert_eq!(env.payload, original_payload);
        assert!(env.encrypted_payload.is_none());
        assert!(env.iv.is_none());
    }

    #[test]
    fn decrypt_with_wrong_psk_fails() {
        let mut env = Envelope::new(MsgType::Chat, "hub", "esp32-01").with_payload(serde_json::json!({"text": "hi"}));
        encrypt_payload(&mut env, &[1u8; 32]).unwrap();
        assert!(decrypt_payload(&mut env, &[2u8; 32]).is_err());
    }

    #[test]
    fn broadcast_envelopes_are_never_marked_encryptable() {
        let env = Envelope::new(MsgType::Command, "hub", BROADCAST_TARGET);
        assert!(!env.is_encryptable());
    }

    #[test]
    fn discovery_peer_seen_auto_registers_an_unknown_device_and_marks_it_online() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(dir.path().join("registry.json")).unwrap();
        let peer = PeerInfo {
            node_id: "esp32-01".to_string(),
            addr: "127.0.0.1:7711".parse().unwrap(),
            roles: vec!["sensor".to_string()],
            last_seen: std::time::Instant::now(),
        };

        on_discovery_peer_seen(&registry, &peer);

        let device = registry.get("esp32-01").unwrap();
        assert!(device.online);
        assert_eq!(device.metadata.get("roles"), Some(&serde_json::json!(["sensor"])));
    }

    #[test]
    fn discovery_peer_seen_for_an_already_registered_device_marks_it_online_without_touching_its_state() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(dir.path().join("registry.json")).unwrap();
        registry.register(meshhub_core::device::Device::new("esp32-01", "thermostat")).unwrap();
        let mut state = std::collections::HashMap::new();
        state.insert("temperature".to_string(), serde_json::json!(21.5));
        registry.update_state("esp32-01", state).unwrap();
        registry.mark_offline("esp32-01").unwrap();

        let peer = PeerInfo {
            node_id: "esp32-01".to_string(),
            addr: "127.0.0.1:7711".parse().unwrap(),
            roles: Vec::new(),
            last_seen: std::time::Instant::now(),
        };
        on_discovery_peer_seen(&registry, &peer);

        let device = registry.get("esp32-01").unwrap();
        assert!(device.online);
        assert_eq!(device.device_type, "thermostat");
        assert_eq!(device.state.get("temperature"), Some(&serde_json::json!(21.5)));
    }

    #[test]
    fn discovery_peer_lost_marks_a_known_device_offline() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(dir.path().join("registry.json")).unwrap();
        registry.register(meshhub_core::device::Device::new("esp32-01", "thermostat")).unwrap();

        on_discovery_peer_lost(&registry, "esp32-01");

        assert!(!registry.get("esp32-01").unwrap().online);
    }

    #[tokio::test]
    async fn chat_and_command_envelopes_reach_the_inbound_message_stream() {
        let mut config = test_config();
        config.psk_auth_enabled = false;
        let hub = Hub::new(config).await.unwrap();
        let mut rx = hub.take_inbound_messages().unwrap();
        assert!(hub.take_inbound_messages().is_none(), "the stream can only be taken once");

        let chat = Envelope::new(MsgType::Chat, "esp32-01", "hub").with_payload(serde_json::json!({"text": "hi"}));
        hub.handle_envelope(chat).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.msg_type, MsgType::Chat);
        assert_eq!(received.source, "esp32-01");
    }

    #[tokio::test]
    async fn federation_envelope_reaches_the_federation_manager() {
        let mut config = test_config();
        config.psk_auth_enabled = false;
        let fed_dir = tempdir().unwrap();
        let fed_config_path = fed_dir.path().join("federation.json");
        std::fs::write(&fed_config_path, r#"{"peers": [], "sync_interval_secs": 30}"#).unwrap();
        config.federation_config = Some(fed_config_path);
        let hub = Hub::new(config).await.unwrap();

        // FEDERATION_SYNC from a peer records remote device ownership — only
        // reachable through FederationManager::handle_envelope, which this
        // proves Hub::handle_envelope actually routes to regardless of
        // whether hub-b is a configured outbound peer.
        let env = Envelope::new(MsgType::FederationSync, "hub-b", "hub")
            .with_payload(serde_json::json!({"hub_id": "hub-b", "devices": ["dev-b"]}));
        hub.handle_envelope(env).await.unwrap();

        assert_eq!(hub.federation.as_ref().unwrap().remote_owner("dev-b"), Some("hub-b".to_string()));
    }

    #[test]
    fn attach_device_certificate_adds_ca_and_device_pems() {
        let dir = tempdir().unwrap();
        let ca = MeshCa::load_or_create(&dir.path().join("root.crt"), &dir.path().join("root.key"), dir.path().join("revoked.json"))
            .unwrap();
        let mut envelope =
            Envelope::new(MsgType::EnrollResponse, "hub", "esp32-01").with_payload(serde_json::json!({"status": "ok"}));

        attach_device_certificate(&ca, "esp32-01", &mut envelope).unwrap();

        assert_eq!(envelope.payload["ca_cert_pem"], serde_json::json!(ca.root_cert_pem()));
        assert!(envelope.payload["cert_pem"].as_str().unwrap().contains("BEGIN CERTIFICATE"));
        assert!(envelope.payload["key_pem"].as_str().unwrap().contains("BEGIN"));
        assert!(ca.list_device_certs().iter().any(|c| c.node_id == "esp32-01"));
    }

    #[tokio::test]
    async fn revoke_device_without_mtls_is_an_error() {
        let hub = Hub::new(test_config()).await.unwrap();
        assert!(hub.revoke_device("X").is_err());
        assert!(hub.list_device_certs().is_empty());
    }
}
