//! Device groups and scenes: named collections of devices, and named sets
//! of commands that can be fanned out together.

use meshhub_core::command::{Action, DeviceCommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub group_id: String,
    pub name: String,
    #[serde(default)]
    pub device_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneCommandSpec {
    pub device: String,
    pub capability: String,
    #[serde(default = "default_action")]
    pub action: Action,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

fn default_action() -> Action {
    Action::Set
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub scene_id: String,
    pub name: String,
    #[serde(default)]
    pub commands: Vec<SceneCommandSpec>,
}

#[derive(Default, Serialize, Deserialize)]
struct GroupsFile {
    #[serde(default)]
    groups: Vec<DeviceGroup>,
}

#[derive(Default, Serialize, Deserialize)]
struct ScenesFile {
    #[serde(default)]
    scenes: Vec<Scene>,
}

/// CRUD + persistence for device groups and scenes, and the fan-out/scene
/// expansion helpers the hub dispatches through.
pub struct GroupManager {
    groups_path: PathBuf,
    scenes_path: PathBuf,
    groups: std::sync::RwLock<HashMap<String, DeviceGroup>>,
    scenes: std::sync::RwLock<HashMap<String, Scene>>,
}

impl GroupManager {
    pub fn load(groups_path: impl Into<PathBuf>, scenes_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let groups_path = groups_path.into();
        let scenes_path = scenes_path.into();

        let groups = if groups_path.exists() {
            let raw = fs::read_to_string(&groups_path)?;
            serde_json::from_str::<GroupsFile>(&raw)?.groups
        } else {
            Vec::new()
        };
        let scenes = if scenes_path.exists() {
            let raw = fs::read_to_string(&scenes_path)?;
            serde_json::from_str::<ScenesFile>(&raw)?.scenes
        } else {
            Vec::new()
        };

        Ok(Self {
            groups_path,
            scenes_path,
            groups: std::sync::RwLock::new(groups.into_iter().map(|g| (g.group_id.clone(), g)).collect()),
            scenes: std::sync::RwLock::new(scenes.into_iter().map(|s| (s.scene_id.clone(), s)).collect()),
        })
    }

    pub fn add_group(&self, group: DeviceGroup) -> anyhow::Result<()> {
        self.groups.write().unwrap().insert(group.group_id.clone(), group);
        self.save_groups()
    }

    pub fn remove_group(&self, group_id: &str) -> anyhow::Result<bool> {
        let removed = self.groups.write().unwrap().remove(group_id).is_some();
        if removed {
            self.save_groups()?;
        }
        Ok(removed)
    }

    pub fn get_group(&self, group_id: &str) -> Option<DeviceGroup> {
        self.groups.read().unwrap().get(group_id).cloned()
    }

    pub fn list_groups(&self) -> Vec<DeviceGroup> {
        self.groups.read().unwrap().values().cloned().collect()
    }

    fn save_groups(&self) -> anyhow::Result<()> {
        let file = GroupsFile { groups: self.groups.read().unwrap().values().cloned().collect() };
        atomic_write_json(&self.groups_path, &file)
    }

    pub fn add_scene(&self, scene: Scene) -> anyhow::Result<()> {
        self.scenes.write().unwrap().insert(scene.scene_id.clone(), scene);
        self.save_scenes()
    }

    pub fn remove_scene(&self, scene_id: &str) -> anyhow::Result<bool> {
        let removed = self.scenes.write().unwrap().remove(scene_id).is_some();
        if removed {
            self.save_scenes()?;
        }
        Ok(removed)
    }

    pub fn get_scene(&self, scene_id: &str) -> Option<Scene> {
        self.scenes.read().unwrap().get(scene_id).cloned()
    }

    pub fn list_scenes(&self) -> Vec<Scene> {
        self.scenes.read().unwrap().values().cloned().collect()
    }

    fn save_scenes(&self) -> anyhow::Result<()> {
        let file = ScenesFile { scenes: self.scenes.read().unwrap().values().cloned().collect() };
        atomic_write_json(&self.scenes_path, &file)
    }

    /// Expand a group into one identical command per member device.
    pub fn fan_out_group_command(&self, group_id: &str, capability: &str, action: Action, params: HashMap<String, serde_json::Value>) -> Vec<DeviceCommand> {
        let Some(group) = self.get_group(group_id) else { return Vec::new() };
        group
            .device_ids
            .into_iter()
            .map(|device_id| DeviceCommand { device: device_id, action, capability: capability.to_string(), params: params.clone() })
            .collect()
    }

    /// Expand a scene into its command list. Malformed entries (missing
    /// fields that fail to deserialize) are logged and skipped rather than
    /// aborting the whole scene.
    pub fn get_scene_commands(&self, scene_id: &str) -> Vec<DeviceCommand> {
        let Some(scene) = self.get_scene(scene_id) else {
            warn!(scene = %scene_id, "scene not found");
            return Vec::new();
        };
        scene
            .commands
            .into_iter()
            .map(|spec| DeviceCommand { device: spec.device, action: spec.action, capability: spec.capability, params: spec.params })
            .collect()
    }

    pub fn describe_groups(&self) -> String {
        let groups = self.groups.read().unwrap();
        if groups.is_empty() {
            return "No device groups configured.".to_string();
        }
        let mut lines = vec!["## Groups".to_string()];
        for group in groups.values() {
            lines.push(format!("- **{}** ({}): {}", group.name, group.group_id, group.device_ids.join(", ")));
        }
        lines.join("\n")
    }

    pub fn describe_scenes(&self) -> String {
        let scenes = self.scenes.read().unwrap();
        if scenes.is_empty() {
            return "No scenes configured.".to_string();
        }
        let mut lines = vec!["## Scenes".to_string()];
        for scene in scenes.values() {
            lines.push(format!("- **{}** ({}): {} command(s)", scene.name, scene.scene_id, scene.commands.len()));
        }
        lines.join("\n")
    }
}

fn atomic_write_json<T: Serialize>(path: &std::path::Path, value: &T) -> anyhow::Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fan_out_produces_one_command_per_member() {
        let dir = tempdir().unwrap();
        let manager = GroupManager::load(dir.path().join("groups.json"), dir.path().join("scenes.json")).unwrap();
        manager
            .add_group(DeviceGroup {
                group_id: "living-room".into(),
                name: "Living Room".into(),
                device_ids: vec!["light-01".into(), "light-02".into()],
            })
            .unwrap();

        let commands = manager.fan_out_group_command(
            "living-room",
            "power",
            Action::Set,
            HashMap::from([("value".to_string(), serde_json::json!(false))]),
        );
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn unknown_scene_yields_no_commands() {
        let dir = tempdir().unwrap();
        let manager = GroupManager::load(dir.path().join("groups.json"), dir.path().join("scenes.json")).unwrap();
        assert!(manager.get_scene_commands("ghost").is_empty());
    }
}
