//! Over-the-air firmware delivery: offer/accept/chunk/verify/complete state
//! machine, plus the on-disk firmware store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

const OFFER_TIMEOUT: Duration = Duration::from_secs(60);
const CHUNK_ACK_TIMEOUT: Duration = Duration::from_secs(30);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("unknown firmware: {0}")]
    UnknownFirmware(String),
    #[error("no active session for device {0}")]
    NoSession(String),
    #[error("device {0} already has an update in progress")]
    SessionInProgress(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("firmware store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Offered,
    Transferring,
    Verifying,
    Complete,
    Failed,
    Rejected,
}

impl UpdateState {
    fn is_terminal(self) -> bool {
        matches!(self, UpdateState::Complete | UpdateState::Failed | UpdateState::Rejected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub firmware_id: String,
    pub device_type: String,
    pub version: String,
    pub size: u64,
    pub sha256: String,
    pub added_date: String,
}

/// Tracks an in-flight update to one device.
#[derive(Debug, Clone)]
pub struct OtaSession {
    pub device_id: String,
    pub firmware_id: String,
    pub chunk_size: usize,
    pub total_chunks: u32,
    pub next_chunk: u32,
    pub state: UpdateState,
    #[allow(dead_code)]
    started_at: Instant,
    last_activity: Instant,
}

impl OtaSession {
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.next_chunk as f64 / self.total_chunks as f64
    }
}

#[derive(Default, Serialize, Deserialize)]
struct FirmwareManifest {
    #[serde(flatten)]
    entries: HashMap<String, FirmwareInfo>,
}

/// Directory of firmware blobs plus their JSON manifest.
pub struct FirmwareStore {
    dir: PathBuf,
}

impl FirmwareStore {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    fn blob_path(&self, firmware_id: &str) -> PathBuf {
        self.dir.join(format!("{firmware_id}.bin"))
    }

    fn load_manifest(&self) -> anyhow::Result<FirmwareManifest> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(FirmwareManifest::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn save_manifest(&self, manifest: &FirmwareManifest) -> anyhow::Result<()> {
        let body = serde_json::to_string_pretty(manifest)?;
        let tmp = self.manifest_path().with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.manifest_path())?;
        Ok(())
    }

    pub fn add_firmware(&self, device_type: &str, version: &str, blob: &[u8]) -> anyhow::Result<FirmwareInfo> {
        let firmware_id = format!("{device_type}-{version}");
        let sha256 = hex::encode(Sha256::digest(blob));
        fs::write(self.blob_path(&firmware_id), blob)?;

        let info = FirmwareInfo {
            firmware_id: firmware_id.clone(),
            device_type: device_type.to_string(),
            version: version.to_string(),
            size: blob.len() as u64,
            sha256,
            added_date: iso_now(),
        };

        let mut manifest = self.load_manifest()?;
        manifest.entries.insert(firmware_id, info.clone());
        self.save_manifest(&manifest)?;
        Ok(info)
    }

    pub fn remove_firmware(&self, firmware_id: &str) -> anyhow::Result<bool> {
        let mut manifest = self.load_manifest()?;
        let Some(_) = manifest.entries.remove(firmware_id) else { return Ok(false) };
        self.save_manifest(&manifest)?;
        let _ = fs::remove_file(self.blob_path(firmware_id));
        Ok(true)
    }

    pub fn get(&self, firmware_id: &str) -> anyhow::Result<Option<FirmwareInfo>> {
        Ok(self.load_manifest()?.entries.get(firmware_id).cloned())
    }

    pub fn read_chunk(&self, firmware_id: &str, chunk_index: u32, chunk_size: usize) -> anyhow::Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = fs::File::open(self.blob_path(firmware_id))?;
        let offset = chunk_index as u64 * chunk_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; chunk_size];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

fn iso_now() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Drives update sessions across devices: offers firmware, serves chunks on
/// ack, and tracks each device through the verify/complete/fail lifecycle.
pub struct OtaManager {
    store: FirmwareStore,
    sessions: std::sync::RwLock<HashMap<String, OtaSession>>,
    chunk_size: usize,
}

impl OtaManager {
    pub fn new(store: FirmwareStore, chunk_size: usize) -> Self {
        Self { store, sessions: std::sync::RwLock::new(HashMap::new()), chunk_size }
    }

    pub fn store(&self) -> &FirmwareStore {
        &self.store
    }

    pub fn start_update(&self, device_id: &str, firmware_id: &str) -> Result<FirmwareInfo, OtaError> {
        if let Some(existing) = self.sessions.read().unwrap().get(device_id) {
            if !existing.state.is_terminal() {
                return Err(OtaError::SessionInProgress(device_id.to_string()));
            }
        }

        let info = self
            .store
            .get(firmware_id)
            .map_err(|e| OtaError::Store(e.to_string()))?
            .ok_or_else(|| OtaError::UnknownFirmware(firmware_id.to_string()))?;

        let total_chunks = (info.size as usize).div_ceil(self.chunk_size).max(1) as u32;
        let session = OtaSession {
            device_id: device_id.to_string(),
            firmware_id: firmware_id.to_string(),
            chunk_size: self.chunk_size,
            total_chunks,
            next_chunk: 0,
            state: UpdateState::Offered,
            started_at: Instant::now(),
            last_activity: Instant::now(),
        };
        self.sessions.write().unwrap().insert(device_id.to_string(), session);
        info!(device = %device_id, firmware = %firmware_id, "ota update offered");
        Ok(info)
    }

    pub fn on_accept(&self, device_id: &str) -> Result<(), OtaError> {
        self.transition(device_id, UpdateState::Transferring)
    }

    pub fn on_reject(&self, device_id: &str) -> Result<(), OtaError> {
        self.transition(device_id, UpdateState::Rejected)
    }

    /// Returns the next chunk to send, advancing the session's cursor.
    pub fn next_chunk(&self, device_id: &str) -> Result<(u32, Vec<u8>), OtaError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(device_id).ok_or_else(|| OtaError::NoSession(device_id.to_string()))?;
        let index = session.next_chunk;
        let firmware_id = session.firmware_id.clone();
        let chunk_size = session.chunk_size;
        session.last_activity = Instant::now();
        drop(sessions);

        let data = self.store.read_chunk(&firmware_id, index, chunk_size)
            .map_err(|e| OtaError::Store(e.to_string()))?;
        Ok((index, data))
    }

    pub fn on_chunk_ack(&self, device_id: &str, chunk_index: u32) -> Result<bool, OtaError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(device_id).ok_or_else(|| OtaError::NoSession(device_id.to_string()))?;
        if chunk_index != session.next_chunk {
            // Out-of-order ack: ignore, keep waiting for the expected one.
            return Ok(false);
        }
        session.next_chunk = chunk_index + 1;
        session.last_activity = Instant::now();
        let done = session.next_chunk >= session.total_chunks;
        if done {
            session.state = UpdateState::Verifying;
        }
        Ok(done)
    }

    pub fn on_verify(&self, device_id: &str, device_sha256: &str) -> Result<bool, OtaError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(device_id).ok_or_else(|| OtaError::NoSession(device_id.to_string()))?;
        let firmware_id = session.firmware_id.clone();
        drop(sessions);

        let expected = self
            .store
            .get(&firmware_id)
            .map_err(|e| OtaError::Store(e.to_string()))?
            .ok_or_else(|| OtaError::UnknownFirmware(firmware_id.clone()))?
            .sha256;

        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(device_id).unwrap();
        if device_sha256 == expected {
            session.state = UpdateState::Complete;
            Ok(true)
        } else {
            warn!(device = %device_id, "ota verification hash mismatch");
            session.state = UpdateState::Failed;
            Ok(false)
        }
    }

    pub fn on_device_abort(&self, device_id: &str) -> Result<(), OtaError> {
        self.transition(device_id, UpdateState::Failed)
    }

    fn transition(&self, device_id: &str, state: UpdateState) -> Result<(), OtaError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.get_mut(device_id).ok_or_else(|| OtaError::NoSession(device_id.to_string()))?;
        session.state = state;
        session.last_activity = Instant::now();
        Ok(())
    }

    pub fn session(&self, device_id: &str) -> Option<OtaSession> {
        self.sessions.read().unwrap().get(device_id).cloned()
    }

    /// Fail any session that has been idle longer than its phase's timeout.
    pub fn check_timeouts(&self) {
        let mut sessions = self.sessions.write().unwrap();
        for (device_id, session) in sessions.iter_mut() {
            let timeout = match session.state {
                UpdateState::Offered => OFFER_TIMEOUT,
                UpdateState::Transferring => CHUNK_ACK_TIMEOUT,
                UpdateState::Verifying => VERIFY_TIMEOUT,
                _ => continue,
            };
            if session.last_activity.elapsed() > timeout {
                warn!(device = %device_id, state = ?session.state, "ota session timed out");
                session.state = UpdateState::Failed;
            }
        }
    }

    /// Drop sessions that reached a terminal state, reclaiming memory.
    pub fn cleanup_completed(&self) {
        self.sessions.write().unwrap().retain(|_, s| !s.state.is_terminal());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn full_update_lifecycle_completes() {
        let dir = tempdir().unwrap();
        let store = FirmwareStore::new(dir.path().join("fw")).unwrap();
        let blob = vec![0xABu8; 10_000];
        let info = store.add_firmware("esp32", "1.2.0", &blob).unwrap();

        let manager = OtaManager::new(store, 4096);
        manager.start_update("esp32-01", &info.firmware_id).unwrap();
        manager.on_accept("esp32-01").unwrap();

        let session = manager.session("esp32-01").unwrap();
        assert_eq!(session.total_chunks, 3);

        for _ in 0..3 {
            let (index, _data) = manager.next_chunk("esp32-01").unwrap();
            manager.on_chunk_ack("esp32-01", index).unwrap();
        }

        let session = manager.session("esp32-01").unwrap();
        assert_eq!(session.state, UpdateState::Verifying);

        let verified = manager.on_verify("esp32-01", &info.sha256).unwrap();
        assert!(verified);
        assert_eq!(manager.session("esp32-01").unwrap().state, UpdateState::Complete);
    }

    #[test]
    fn chunked_transfer_base64_payloads_reassemble_into_original_firmware() {
        use base64::Engine;

        let dir = tempdir().unwrap();
        let store = FirmwareStore::new(dir.path().join("fw")).unwrap();
        let blob: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        let info = store.add_firmware("esp32", "1.2.0", &blob).unwrap();

        let manager = OtaManager::new(store, 256);
        manager.start_update("dev-01", &info.firmware_id).unwrap();
        assert_eq!(manager.session("dev-01").unwrap().state, UpdateState::Offered);

        manager.on_accept("dev-01").unwrap();
        assert_eq!(manager.session("dev-01").unwrap().state, UpdateState::Transferring);
        assert_eq!(manager.session("dev-01").unwrap().total_chunks, 4);

        let mut reassembled = Vec::new();
        for expected_seq in 0..4u32 {
            let (seq, data) = manager.next_chunk("dev-01").unwrap();
            assert_eq!(seq, expected_seq);
            let payload_b64 = base64::engine::general_purpose::STANDARD.encode(&data);
            reassembled.extend(base64::engine::general_purpose::STANDARD.decode(&payload_b64).unwrap());
            manager.on_chunk_ack("dev-01", seq).unwrap();
        }
        assert_eq!(manager.session("dev-01").unwrap().state, UpdateState::Verifying);
        assert_eq!(reassembled, blob);

        assert!(manager.on_verify("dev-01", &info.sha256).unwrap());
        assert_eq!(manager.session("dev-01").unwrap().state, UpdateState::Complete);
    }

    #[test]
    fn verify_with_wrong_hash_fails() {
        let dir = tempdir().unwrap();
        let store = FirmwareStore::new(dir.path().join("fw")).unwrap();
        let info = store.add_firmware("esp32", "1.2.0", &[1, 2, 3]).unwrap();
        let manager = OtaManager::new(store, 4096);
        manager.start_update("esp32-01", &info.firmware_id).unwrap();
        manager.on_accept("esp32-01").unwrap();
        let (index, _) = manager.next_chunk("esp32-01").unwrap();
        manager.on_chunk_ack("esp32-01", index).unwrap();

        let verified = manager.on_verify("esp32-01", "deadbeef").unwrap();
        assert!(!verified);
        assert_eq!(manager.session("esp32-01").unwrap().state, UpdateState::Failed);
    }

    #[test]
    fn starting_an_update_while_one_is_already_in_progress_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FirmwareStore::new(dir.path().join("fw")).unwrap();
        let info = store.add_firmware("esp32", "1.2.0", &[1, 2, 3]).unwrap();
        let manager = OtaManager::new(store, 4096);
        manager.start_update("esp32-01", &info.firmware_id).unwrap();

        let err = manager.start_update("esp32-01", &info.firmware_id).unwrap_err();
        assert!(matches!(err, OtaError::SessionInProgress(ref id) if id == "esp32-01"));

        // Once the session reaches a terminal state, a new update is allowed.
        manager.on_reject("esp32-01").unwrap();
        assert!(manager.start_update("esp32-01", &info.firmware_id).is_ok());
    }
}
