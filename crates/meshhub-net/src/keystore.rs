//! Pre-shared key storage, envelope signing, and replay defense.

use indexmap::IndexMap;
use meshhub_core::canonical::canonical_envelope_bytes;
use meshhub_core::crypto::{compute_hmac, verify_hmac};
use meshhub_core::{Envelope, Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// How far a signed envelope's timestamp may drift from wall-clock `now`
/// before it is rejected as stale or futuristic.
pub const TIMESTAMP_WINDOW_SECS: f64 = 30.0;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PskRecord {
    pub node_id: String,
    #[serde(with = "hex_bytes")]
    pub psk: Vec<u8>,
    pub enrolled_at: String,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    keys: Vec<PskRecord>,
}

/// Holds every enrolled device's pre-shared key, plus a per-device nonce
/// cache used to reject replayed envelopes.
pub struct KeyStore {
    path: PathBuf,
    keys: RwLock<IndexMap<String, PskRecord>>,
    seen_nonces: RwLock<IndexMap<String, IndexMap<String, f64>>>,
    window_secs: f64,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_window(path, TIMESTAMP_WINDOW_SECS)
    }

    /// Like [`KeyStore::new`], but with a caller-supplied replay window
    /// instead of the [`TIMESTAMP_WINDOW_SECS`] default.
    pub fn with_window(path: impl Into<PathBuf>, window_secs: f64) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| Error::KeyDerivation(e.to_string()))?;
            serde_json::from_str(&raw)?
        } else {
            PersistedState::default()
        };

        let mut keys = IndexMap::new();
        for record in state.keys {
            keys.insert(record.node_id.clone(), record);
        }

        Ok(Self {
            path,
            keys: RwLock::new(keys),
            seen_nonces: RwLock::new(IndexMap::new()),
            window_secs,
        })
    }

    pub fn insert(&self, node_id: impl Into<String>, psk: Vec<u8>, enrolled_at: impl Into<String>) -> Result<()> {
        let node_id = node_id.into();
        self.keys.write().insert(
            node_id.clone(),
            PskRecord { node_id, psk, enrolled_at: enrolled_at.into() },
        );
        self.persist()
    }

    pub fn remove(&self, node_id: &str) -> Result<()> {
        self.keys.write().shift_remove(node_id);
        self.seen_nonces.write().shift_remove(node_id);
        self.persist()
    }

    pub fn psk(&self, node_id: &str) -> Option<Vec<u8>> {
        self.keys.read().get(node_id).map(|r| r.psk.clone())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.keys.read().contains_key(node_id)
    }

    fn persist(&self) -> Result<()> {
        let state = PersistedState {
            keys: self.keys.read().values().cloned().collect(),
        };
        let body = serde_json::to_string_pretty(&state)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &body).map_err(|e| Error::KeyDerivation(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::KeyDerivation(e.to_string()))?;
        set_owner_only(&self.path);
        Ok(())
    }

    /// Sign an outgoing envelope in place: assigns a fresh nonce and
    /// computes its HMAC over the canonical form.
    pub fn sign(&self, env: &mut Envelope) -> Result<()> {
        let psk = self
            .psk(&env.target)
            .or_else(|| self.psk(&env.source))
            .ok_or_else(|| Error::InvalidEnvelope(format!("no psk for {}/{}", env.source, env.target)))?;
        let nonce = random_nonce();
        env.nonce = Some(nonce.clone());
        env.hmac = None;
        let canonical = canonical_envelope_bytes(env)?;
        env.hmac = Some(compute_hmac(&canonical, &nonce, &psk)?);
        Ok(())
    }

    /// Verify an inbound envelope's HMAC, timestamp freshness, and nonce
    /// uniqueness. Returns `Ok(())` only if the envelope should be
    /// dispatched; any failure means the envelope must be dropped silently
    /// without informing the sender which check failed.
    pub fn verify(&self, env: &Envelope, now: f64) -> Result<()> {
        let device_id = if env.source != "hub" { &env.source } else { &env.target };
        let psk = self.psk(device_id).ok_or(Error::HmacMismatch)?;

        let nonce = env.nonce.as_deref().ok_or(Error::HmacMismatch)?;
        let tag = env.hmac.as_deref().ok_or(Error::HmacMismatch)?;

        if (env.ts - now).abs() > self.window_secs {
            warn!(device = %device_id, "rejecting envelope outside timestamp window");
            return Err(Error::InvalidEnvelope("timestamp outside window".into()));
        }

        let canonical = canonical_envelope_bytes(env)?;
        if !verify_hmac(&canonical, nonce, &psk, tag) {
            return Err(Error::HmacMismatch);
        }

        if !self.record_nonce(device_id, nonce, now) {
            warn!(device = %device_id, "rejecting replayed nonce");
            return Err(Error::InvalidEnvelope("nonce replay".into()));
        }

        Ok(())
    }

    /// Prunes nonces older than `window_secs` from the front, then records
    /// `nonce` at `now`. Returns `false` if the nonce was already seen
    /// within the window (a replay); once a nonce ages out of the window it
    /// is forgotten and becomes acceptable again, matching the replay check
    /// it guards.
    fn record_nonce(&self, device_id: &str, nonce: &str, now: f64) -> bool {
        let mut table = self.seen_nonces.write();
        let cache = table.entry(device_id.to_string()).or_default();

        while let Some((_, &oldest_ts)) = cache.get_index(0) {
            if now - oldest_ts > self.window_secs {
                cache.shift_remove_index(0);
            } else {
                break;
            }
        }

        if cache.contains_key(nonce) {
            return false;
        }
        cache.insert(nonce.to_string(), now);
        true
    }
}

fn random_nonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) {}

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshhub_core::MsgType;
    use tempfile::tempdir;

    #[test]
    fn sign_then_verify_round_trips() {
        let dir = tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys.json")).unwrap();
        store.insert("esp32-01", vec![9u8; 32], "2026-01-01T00:00:00Z").unwrap();

        let mut env = Envelope::new(MsgType::StateReport, "esp32-01", "hub");
        env.ts = now_secs();
        store.sign(&mut env).unwrap();

        assert!(store.verify(&env, env.ts).is_ok());
    }

    #[test]
    fn replayed_nonce_is_rejected_on_second_delivery() {
        let dir = tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys.json")).unwrap();
        store.insert("esp32-01", vec![9u8; 32], "2026-01-01T00:00:00Z").unwrap();

        let mut env = Envelope::new(MsgType::StateReport, "esp32-01", "hub");
        env.ts = now_secs();
        store.sign(&mut env).unwrap();

        assert!(store.verify(&env, env.ts).is_ok());
        assert!(store.verify(&env, env.ts).is_err());
    }

    #[test]
    fn custom_window_rejects_replay_and_out_of_window_timestamp() {
        let dir = tempdir().unwrap();
        let store = KeyStore::with_window(dir.path().join("keys.json"), 60.0).unwrap();
        store.insert("esp32-01", vec![9u8; 32], "2026-01-01T00:00:00Z").unwrap();

        let t = now_secs();
        let mut first = Envelope::new(MsgType::StateReport, "esp32-01", "hub");
        first.ts = t;
        store.sign(&mut first).unwrap();
        assert!(store.verify(&first, t).is_ok());

        // Resending the identical envelope is a replayed nonce.
        assert!(store.verify(&first, t).is_err());

        // A fresh nonce but a timestamp 120s in the past falls outside a
        // 60s window.
        let mut stale = Envelope::new(MsgType::StateReport, "esp32-01", "hub");
        stale.ts = t - 120.0;
        store.sign(&mut stale).unwrap();
        assert!(store.verify(&stale, t).is_err());
    }

    #[test]
    fn nonce_is_accepted_again_once_it_ages_out_of_the_window() {
        let dir = tempdir().unwrap();
        let store = KeyStore::with_window(dir.path().join("keys.json"), 60.0).unwrap();
        let psk = vec![9u8; 32];
        store.insert("esp32-01", psk.clone(), "2026-01-01T00:00:00Z").unwrap();

        let nonce = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string();
        let t0 = now_secs();

        let mut first = Envelope::new(MsgType::StateReport, "esp32-01", "hub");
        first.ts = t0;
        first.nonce = Some(nonce.clone());
        let canonical = canonical_envelope_bytes(&first).unwrap();
        first.hmac = Some(compute_hmac(&canonical, &nonce, &psk).unwrap());
        assert!(store.verify(&first, t0).is_ok());

        // Same nonce again inside the window is a replay.
        assert!(store.verify(&first, t0).is_err());

        // Past the 60s window the nonce has aged out of the cache, so a
        // fresh envelope reusing it is accepted again.
        let t1 = t0 + 61.0;
        let mut second = Envelope::new(MsgType::StateReport, "esp32-01", "hub");
        second.ts = t1;
        second.nonce = Some(nonce.clone());
        let canonical = canonical_envelope_bytes(&second).unwrap();
        second.hmac = Some(compute_hmac(&canonical, &nonce, &psk).unwrap());
        assert!(store.verify(&second, t1).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let dir = tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys.json")).unwrap();
        store.insert("esp32-01", vec![9u8; 32], "2026-01-01T00:00:00Z").unwrap();

        let mut env = Envelope::new(MsgType::StateReport, "esp32-01", "hub");
        env.ts = now_secs() - 120.0;
        store.sign(&mut env).unwrap();

        assert!(store.verify(&env, now_secs()).is_err());
    }
}
