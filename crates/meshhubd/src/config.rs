//! Configuration for meshhubd.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// meshhubd - LAN Mesh Hub daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "meshhubd")]
#[command(about = "LAN mesh hub: device registry, automation, OTA, and federation")]
pub struct Config {
    /// This hub's node id on the mesh
    #[arg(long, env = "MESHHUB_NODE_ID", default_value = "hub")]
    pub node_id: String,

    /// TCP listen address for mesh connections
    #[arg(long, env = "MESHHUB_LISTEN", default_value = "0.0.0.0:7711")]
    pub listen: SocketAddr,

    /// UDP port used for broadcast discovery
    #[arg(long, env = "MESHHUB_DISCOVERY_PORT", default_value = "48391")]
    pub discovery_port: u16,

    /// Role tags this hub advertises on its discovery beacon
    #[arg(long, value_delimiter = ',')]
    pub roles: Vec<String>,

    /// Data directory for persistent state (keys, registry, rules, firmware…)
    #[arg(long, env = "MESHHUB_DATA_DIR", default_value = "./data/meshhub")]
    pub data_dir: PathBuf,

    /// Require PSK-HMAC auth on every envelope
    #[arg(long, env = "MESHHUB_PSK_AUTH", default_value = "true")]
    pub psk_auth_enabled: bool,

    /// Accept envelopes from devices with no PSK on record (provisioning mode)
    #[arg(long, env = "MESHHUB_ALLOW_UNAUTH")]
    pub allow_unauthenticated: bool,

    /// Accepted timestamp drift for signed envelopes, in seconds
    #[arg(long, default_value = "30")]
    pub nonce_window_secs: u64,

    /// Enable AES-256-GCM payload encryption for chat/command/response
    #[arg(long, env = "MESHHUB_ENCRYPTION", default_value = "true")]
    pub encryption_enabled: bool,

    /// Enrollment PIN length
    #[arg(long, default_value = "6")]
    pub enrollment_pin_length: u8,

    /// Enrollment PIN validity window, in seconds
    #[arg(long, default_value = "300")]
    pub enrollment_timeout_secs: u64,

    /// Max enrollment PIN attempts before the pending pairing is cancelled
    #[arg(long, default_value = "3")]
    pub enrollment_max_attempts: u32,

    /// Require mTLS on top of HMAC/AEAD application-layer auth
    #[arg(long, env = "MESHHUB_MTLS")]
    pub mtls_enabled: bool,

    /// Directory holding the local CA root cert/key and revocation list
    #[arg(long, default_value = "./data/meshhub/ca")]
    pub ca_dir: PathBuf,

    /// Validity period for issued device certificates, in days
    #[arg(long, default_value = "365")]
    pub device_cert_validity_days: u32,

    /// Directory holding firmware blobs and the firmware manifest
    #[arg(long, default_value = "./data/meshhub/firmware")]
    pub firmware_dir: PathBuf,

    /// OTA chunk size, in bytes
    #[arg(long, default_value = "4096")]
    pub ota_chunk_size: usize,

    /// OTA per-phase timeout, in seconds (offer/chunk-ack/verify)
    #[arg(long, default_value = "60")]
    pub ota_timeout_secs: u64,

    /// Path to groups.json
    #[arg(long, default_value = "./data/meshhub/groups.json")]
    pub groups_path: PathBuf,

    /// Path to scenes.json
    #[arg(long, default_value = "./data/meshhub/scenes.json")]
    pub scenes_path: PathBuf,

    /// Path to the federation peer config (peers + sync interval)
    #[arg(long)]
    pub federation_config: Option<PathBuf>,

    /// Sensor ring buffer capacity per (device, capability) pair
    #[arg(long, default_value = "1000")]
    pub pipeline_buffer_capacity: usize,

    /// Sensor pipeline flush interval, in seconds
    #[arg(long, default_value = "60")]
    pub pipeline_flush_interval_secs: u64,

    /// Enable verbose (debug-level) logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format: "json" or "pretty"
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("node id cannot be empty");
        }
        if self.ota_chunk_size == 0 {
            anyhow::bail!("ota chunk size must be positive");
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.json")
    }

    pub fn rules_path(&self) -> PathBuf {
        self.data_dir.join("rules.json")
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.data_dir.join("keys.json")
    }

    pub fn sensor_data_path(&self) -> PathBuf {
        self.data_dir.join("sensor_data.json")
    }
}
