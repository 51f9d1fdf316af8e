//! Command schema & validation (LAN Mesh Hub §4.9).

use crate::device::{CapabilityKind, Device, ValueType};
use crate::envelope::{Envelope, MsgType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Set,
    Get,
    Toggle,
    Execute,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Set => "set",
            Action::Get => "get",
            Action::Toggle => "toggle",
            Action::Execute => "execute",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ok,
    Error,
}

/// A command targeting one device's one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub device: String,
    pub action: Action,
    #[serde(default)]
    pub capability: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// Result of executing (or attempting to execute) a `DeviceCommand`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub target: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub capability: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub error: String,
}

/// Convert a validated command into the wire envelope that carries it.
pub fn command_to_envelope(cmd: &DeviceCommand, source: &str) -> Envelope {
    let payload = serde_json::json!({
        "device": cmd.device,
        "action": cmd.action.as_str(),
        "capability": cmd.capability,
        "params": cmd.params,
    });
    Envelope::new(MsgType::Command, source, cmd.device.clone()).with_payload(payload)
}

/// Validate a command against a device's registered capabilities.
///
/// Returns an ordered list of human-readable errors; an empty list means
/// the command may be executed. Validation never has side effects and
/// never raises — every failure mode the wire format allows is expressed
/// as a list entry here.
pub fn validate_command(cmd: &DeviceCommand, device: Option<&Device>) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(device) = device else {
        errors.push(format!("unknown device: {}", cmd.device));
        return errors;
    };

    if !device.online {
        errors.push(format!("device offline: {}", cmd.device));
    }

    if matches!(cmd.action, Action::Get | Action::Set | Action::Toggle) && cmd.capability.is_empty() {
        errors.push("missing capability for non-execute action".to_string());
        return errors;
    }

    if cmd.action == Action::Execute {
        return errors;
    }

    let Some(capability) = device.capability(&cmd.capability) else {
        errors.push(format!("unknown capability: {}", cmd.capability));
        return errors;
    };

    match cmd.action {
        Action::Set => {
            if capability.cap_type == CapabilityKind::Sensor {
                errors.push(format!("cannot set a sensor capability: {}", cmd.capability));
            }
            if let Some(value) = cmd.params.get("value") {
                if let Some(err) = validate_value(capability, value) {
                    errors.push(err);
                }
            } else {
                errors.push("missing 'value' param for set".to_string());
            }
        }
        Action::Toggle => {
            if capability.data_type != ValueType::Bool {
                errors.push(format!("cannot toggle non-bool capability: {}", cmd.capability));
            }
        }
        Action::Get | Action::Execute => {}
    }

    errors
}

fn validate_value(capability: &crate::device::Capability, value: &Value) -> Option<String> {
    match capability.data_type {
        ValueType::Bool => {
            if !value.is_boolean() {
                return Some(format!("value for {} must be a bool", capability.name));
            }
        }
        ValueType::Int => {
            if !value.is_i64() && !value.is_u64() {
                return Some(format!("value for {} must be an int", capability.name));
            }
        }
        ValueType::Float => {
            if !value.is_number() || value.is_boolean() {
                return Some(format!("value for {} must be numeric", capability.name));
            }
        }
        ValueType::String => {
            if !value.is_string() {
                return Some(format!("value for {} must be a string", capability.name));
            }
        }
        ValueType::Enum => {
            let Some(s) = value.as_str() else {
                return Some(format!("value for {} must be a string", capability.name));
            };
            if !capability.enum_values.iter().any(|v| v == s) {
                return Some(format!("value {s:?} not in allowed set for {}", capability.name));
            }
            return None;
        }
    }

    if matches!(capability.data_type, ValueType::Int | ValueType::Float) {
        if let Some((min, max)) = capability.value_range {
            if let Some(num) = value.as_f64() {
                if num < min || num > max {
                    return Some(format!(
                        "value {num} for {} outside range [{min}, {max}]",
                        capability.name
                    ));
                }
            }
        }
    }
    None
}

/// Render a Markdown list of a device's available actions, for the
/// device-summary contract exposed to the (out-of-scope) agent layer.
pub fn describe_device_commands(device: &Device) -> String {
    if device.capabilities.is_empty() {
        return String::new();
    }
    let mut lines = vec![format!("### {} ({})", device.name, device.node_id)];
    for cap in &device.capabilities {
        let action = match cap.cap_type {
            CapabilityKind::Sensor => "get",
            CapabilityKind::Actuator | CapabilityKind::Property => "set/get",
        };
        lines.push(format!("- `{}` ({action}, {:?})", cap.name, cap.data_type));
    }
    lines.join("\n")
}
