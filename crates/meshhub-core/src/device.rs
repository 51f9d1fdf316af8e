//! Device and capability data model (LAN Mesh Hub §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a capability is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Sensor,
    Actuator,
    Property,
}

/// The runtime type a capability's value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
    Enum,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub cap_type: CapabilityKind,
    pub data_type: ValueType,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub value_range: Option<(f64, f64)>,
    #[serde(default)]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl Default for CapabilityKind {
    fn default() -> Self {
        CapabilityKind::Property
    }
}

impl Default for ValueType {
    fn default() -> Self {
        ValueType::String
    }
}

/// A device's identity, capabilities, and latest known state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub state: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: f64,
    #[serde(default)]
    pub registered_at: f64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Device {
    pub fn new(node_id: impl Into<String>, device_type: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            name: node_id.clone(),
            node_id,
            device_type: device_type.into(),
            capabilities: Vec::new(),
            state: HashMap::new(),
            online: false,
            last_seen: 0.0,
            registered_at: 0.0,
            metadata: HashMap::new(),
        }
    }

    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }
}
