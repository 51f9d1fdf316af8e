//! Envelope — one framed message on the mesh wire.
//!
//! Wire framing itself (the 4-byte length prefix + tokio codec) lives in
//! `meshhub-net::framing`; this module owns the message shape and the
//! canonicalisation rule used for HMAC signing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of envelope message types. Unknown types never deserialize —
/// per the protocol's drop-on-unknown-type rule, an envelope whose `type`
/// field doesn't match one of these must fail to parse and the connection
/// that produced it is closed, never dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Chat,
    Command,
    Response,
    Ping,
    Pong,
    EnrollRequest,
    EnrollResponse,
    StateReport,
    OtaOffer,
    OtaAccept,
    OtaReject,
    OtaChunk,
    OtaChunkAck,
    OtaVerify,
    OtaComplete,
    OtaAbort,
    FederationHello,
    FederationSync,
    FederationCommand,
    FederationResponse,
    FederationState,
    FederationPing,
    FederationPong,
}

/// Broadcast target sentinel, matching the wire-level `"*"` convention.
pub const BROADCAST_TARGET: &str = "*";

/// One framed message. Auth fields are present only when signing/encryption
/// are in effect; absent fields deserialize to their defaults so envelopes
/// built before auth was enabled on a peer remain parseable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    pub source: String,
    pub target: String,
    #[serde(default = "now_ts")]
    pub ts: f64,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Envelope {
    pub fn new(msg_type: MsgType, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            msg_type,
            source: source.into(),
            target: target.into(),
            ts: now_ts(),
            payload: Value::Object(Default::default()),
            nonce: None,
            hmac: None,
            encrypted_payload: None,
            iv: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target == BROADCAST_TARGET
    }

    /// Envelope types eligible for payload encryption: unicast chat,
    /// command, and response traffic only.
    pub fn is_encryptable(&self) -> bool {
        matches!(self.msg_type, MsgType::Chat | MsgType::Command | MsgType::Response) && !self.is_broadcast()
    }
}
