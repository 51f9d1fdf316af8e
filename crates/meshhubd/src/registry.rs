//! Device registry: tracks every enrolled device's identity, capabilities,
//! and latest reported state.

use meshhub_core::device::Device;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    DeviceRegistered(String),
    DeviceUpdated(String),
    DeviceOnline(String),
    DeviceOffline(String),
    DeviceRemoved(String),
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedRegistry {
    version: u32,
    updated_at: f64,
    devices: Vec<Device>,
}

/// In-memory device table, persisted to `registry.json` on every mutation
/// and fanned out as events for automation/pipeline/dashboard consumers.
pub struct Registry {
    path: PathBuf,
    devices: RwLock<HashMap<String, Device>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut devices = HashMap::new();
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let persisted: PersistedRegistry = serde_json::from_str(&raw)?;
            for mut device in persisted.devices {
                // A reload starts every device offline; only a fresh
                // discovery beacon or state report marks it online again.
                device.online = false;
                devices.insert(device.node_id.clone(), device);
            }
        }
        let (events, _) = broadcast::channel(256);
        Ok(Self { path, devices: RwLock::new(devices), events })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, node_id: &str) -> Option<Device> {
        self.devices.read().get(node_id).cloned()
    }

    pub fn all(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    pub fn online_devices(&self) -> Vec<Device> {
        self.devices.read().values().filter(|d| d.online).cloned().collect()
    }

    /// Register a device we haven't seen before, or upsert its declared
    /// identity/capabilities if it re-announces (firmware upgrades can add
    /// sensors). A re-announce preserves the original `registered_at` and
    /// the device's last-known `state` rather than clobbering them.
    pub fn register(&self, mut device: Device) -> anyhow::Result<()> {
        let node_id = device.node_id.clone();
        let now = now_secs();
        device.last_seen = now;
        device.online = true;

        let is_new = {
            let mut devices = self.devices.write();
            match devices.get_mut(&node_id) {
                Some(existing) => {
                    device.registered_at = existing.registered_at;
                    device.state = std::mem::take(&mut existing.state);
                    *existing = device;
                    false
                }
                None => {
                    device.registered_at = now;
                    devices.insert(node_id.clone(), device);
                    true
                }
            }
        };
        self.persist()?;
        let event = if is_new { RegistryEvent::DeviceRegistered(node_id) } else { RegistryEvent::DeviceUpdated(node_id) };
        let _ = self.events.send(event);
        Ok(())
    }

    /// Merge a `state_report` payload into a device's last-known state.
    pub fn update_state(&self, node_id: &str, state: HashMap<String, serde_json::Value>) -> anyhow::Result<bool> {
        let updated = {
            let mut devices = self.devices.write();
            match devices.get_mut(node_id) {
                Some(device) => {
                    device.state.extend(state);
                    device.last_seen = now_secs();
                    device.online = true;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist()?;
            let _ = self.events.send(RegistryEvent::DeviceUpdated(node_id.to_string()));
        }
        Ok(updated)
    }

    pub fn mark_online(&self, node_id: &str) -> anyhow::Result<bool> {
        let changed = {
            let mut devices = self.devices.write();
            match devices.get_mut(node_id) {
                Some(device) if !device.online => {
                    device.online = true;
                    device.last_seen = now_secs();
                    true
                }
                Some(device) => {
                    device.last_seen = now_secs();
                    false
                }
                None => return Ok(false),
            }
        };
        if changed {
            self.persist()?;
            let _ = self.events.send(RegistryEvent::DeviceOnline(node_id.to_string()));
        }
        Ok(true)
    }

    pub fn mark_offline(&self, node_id: &str) -> anyhow::Result<()> {
        let changed = {
            let mut devices = self.devices.write();
            match devices.get_mut(node_id) {
                Some(device) if device.online => {
                    device.online = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.persist()?;
            let _ = self.events.send(RegistryEvent::DeviceOffline(node_id.to_string()));
        }
        Ok(())
    }

    pub fn remove(&self, node_id: &str) -> anyhow::Result<bool> {
        let removed = self.devices.write().remove(node_id).is_some();
        if removed {
            self.persist()?;
            let _ = self.events.send(RegistryEvent::DeviceRemoved(node_id.to_string()));
        }
        Ok(removed)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let persisted = PersistedRegistry {
            version: 1,
            updated_at: now_secs(),
            devices: self.devices.read().values().cloned().collect(),
        };
        let body = serde_json::to_string_pretty(&persisted)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Markdown device summary for the agent-facing context contract.
    pub fn summary(&self) -> String {
        let devices = self.devices.read();
        if devices.is_empty() {
            return "No devices registered.".to_string();
        }
        let mut lines = vec!["## Devices".to_string()];
        let mut sorted: Vec<_> = devices.values().collect();
        sorted.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        for device in sorted {
            let status = if device.online { "online" } else { "offline" };
            lines.push(format!("- **{}** ({}) — {} — {} capabilities", device.name, device.node_id, status, device.capabilities.len()));
        }
        lines.join("\n")
    }

    /// JSON device summary for the agent-facing context contract, the
    /// structured counterpart to [`Registry::summary`].
    pub fn to_json_for_llm(&self) -> serde_json::Value {
        let devices = self.devices.read();
        let mut sorted: Vec<_> = devices.values().collect();
        sorted.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        serde_json::json!({
            "device_count": sorted.len(),
            "devices": sorted.iter().map(|d| serde_json::json!({
                "node_id": d.node_id,
                "name": d.name,
                "device_type": d.device_type,
                "online": d.online,
                "state": d.state,
            })).collect::<Vec<_>>(),
        })
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_then_update_state_persists() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(dir.path().join("registry.json")).unwrap();
        let device = Device::new("esp32-01", "thermostat");
        registry.register(device).unwrap();

        let mut state = HashMap::new();
        state.insert("temperature".to_string(), serde_json::json!(21.5));
        assert!(registry.update_state("esp32-01", state).unwrap());

        let reloaded = Registry::load(dir.path().join("registry.json")).unwrap();
        let device = reloaded.get("esp32-01").unwrap();
        assert_eq!(device.state.get("temperature"), Some(&serde_json::json!(21.5)));
    }

    #[test]
    fn update_state_for_unknown_device_is_noop() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(dir.path().join("registry.json")).unwrap();
        assert!(!registry.update_state("ghost", HashMap::new()).unwrap());
    }

    #[test]
    fn reregistering_preserves_registered_at_and_state() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(dir.path().join("registry.json")).unwrap();
        registry.register(Device::new("esp32-01", "thermostat")).unwrap();
        let first_registered_at = registry.get("esp32-01").unwrap().registered_at;

        let mut state = HashMap::new();
        state.insert("temperature".to_string(), serde_json::json!(21.5));
        registry.update_state("esp32-01", state).unwrap();

        // A re-announce (e.g. after a firmware upgrade) with new
        // capabilities must not wipe out registered_at or state.
        let mut reannounced = Device::new("esp32-01", "thermostat");
        reannounced.capabilities.push(meshhub_core::device::Capability {
            name: "humidity".to_string(),
            ..Default::default()
        });
        registry.register(reannounced).unwrap();

        let device = registry.get("esp32-01").unwrap();
        assert_eq!(device.registered_at, first_registered_at);
        assert_eq!(device.state.get("temperature"), Some(&serde_json::json!(21.5)));
        assert_eq!(device.capabilities.len(), 1);
    }

    #[test]
    fn reloading_the_registry_resets_online_to_false() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Registry::load(&path).unwrap();
        registry.register(Device::new("esp32-01", "thermostat")).unwrap();
        assert!(registry.get("esp32-01").unwrap().online);

        let reloaded = Registry::load(&path).unwrap();
        assert!(!reloaded.get("esp32-01").unwrap().online);
    }

    #[test]
    fn mark_online_for_unknown_device_is_noop() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(dir.path().join("registry.json")).unwrap();
        assert!(!registry.mark_online("ghost").unwrap());
    }

    #[test]
    fn mark_online_transitions_an_offline_known_device() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Registry::load(&path).unwrap();
        registry.register(Device::new("esp32-01", "thermostat")).unwrap();
        registry.mark_offline("esp32-01").unwrap();
        assert!(!registry.get("esp32-01").unwrap().online);

        assert!(registry.mark_online("esp32-01").unwrap());
        assert!(registry.get("esp32-01").unwrap().online);
    }
}
