//! Rule engine: evaluates user-defined rules when device state changes and
//! produces `DeviceCommand`s for dispatch by the hub.
//!
//! Evaluation is synchronous (pure value comparisons, no I/O); async
//! dispatch is the caller's job. Rules are indexed by the device ids in
//! their conditions for O(1) lookup on state change, and persist to a JSON
//! file alongside the device registry.

use crate::registry::Registry;
use meshhub_core::command::{Action, DeviceCommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl ComparisonOp {
    fn apply(self, current: &Value, threshold: &Value) -> bool {
        match self {
            ComparisonOp::Eq => current == threshold,
            ComparisonOp::Ne => current != threshold,
            ComparisonOp::Gt | ComparisonOp::Ge | ComparisonOp::Lt | ComparisonOp::Le => {
                let (Some(a), Some(b)) = (current.as_f64(), threshold.as_f64()) else {
                    return false;
                };
                match self {
                    ComparisonOp::Gt => a > b,
                    ComparisonOp::Ge => a >= b,
                    ComparisonOp::Lt => a < b,
                    ComparisonOp::Le => a <= b,
                    _ => unreachable!(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub device_id: String,
    pub capability: String,
    pub operator: ComparisonOp,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    pub device_id: String,
    pub capability: String,
    #[serde(default = "default_action")]
    pub action: Action,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

fn default_action() -> Action {
    Action::Set
}

impl RuleAction {
    fn to_command(&self) -> DeviceCommand {
        DeviceCommand {
            device: self.device_id.clone(),
            action: self.action,
            capability: self.capability.clone(),
            params: self.params.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub last_triggered: f64,
}

fn default_true() -> bool {
    true
}

fn default_cooldown() -> u64 {
    60
}

impl AutomationRule {
    fn trigger_device_ids(&self) -> HashSet<String> {
        self.conditions.iter().map(|c| c.device_id.clone()).collect()
    }
}

/// Validate a rule against the registry: referenced devices/capabilities
/// must exist, and the rule must have at least one condition and action.
pub fn validate_rule(rule: &AutomationRule, registry: &Registry) -> Vec<String> {
    let mut errors = Vec::new();

    if rule.rule_id.is_empty() {
        errors.push("rule must have a non-empty rule_id".to_string());
    }
    if rule.conditions.is_empty() {
        errors.push("rule must have at least one condition".to_string());
    }
    if rule.actions.is_empty() {
        errors.push("rule must have at least one action".to_string());
    }

    for (i, cond) in rule.conditions.iter().enumerate() {
        match registry.get(&cond.device_id) {
            None => errors.push(format!("condition[{i}]: device '{}' not found", cond.device_id)),
            Some(device) => {
                if device.capability(&cond.capability).is_none() {
                    errors.push(format!(
                        "condition[{i}]: device '{}' has no capability '{}'",
                        cond.device_id, cond.capability
                    ));
                }
            }
        }
    }

    for (i, act) in rule.actions.iter().enumerate() {
        match registry.get(&act.device_id) {
            None => errors.push(format!("action[{i}]: device '{}' not found", act.device_id)),
            Some(device) => {
                if device.capability(&act.capability).is_none() {
                    errors.push(format!(
                        "action[{i}]: device '{}' has no capability '{}'",
                        act.device_id, act.capability
                    ));
                }
            }
        }
    }

    errors
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedRules {
    version: u32,
    updated_at: f64,
    rules: Vec<AutomationRule>,
}

/// Evaluates automation rules when device state changes. Evaluation itself
/// is synchronous; the caller dispatches the returned commands.
pub struct AutomationEngine {
    path: PathBuf,
    rules: std::sync::RwLock<HashMap<String, AutomationRule>>,
    device_index: std::sync::RwLock<HashMap<String, HashSet<String>>>,
}

impl AutomationEngine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rules: std::sync::RwLock::new(HashMap::new()),
            device_index: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Load rules from disk. A missing file means an empty rule set, not
    /// an error — a freshly provisioned hub has no rules yet.
    pub fn load(&self) -> anyhow::Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no automation rules file, starting empty");
            return Ok(());
        }
        let text = fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(());
        }
        let persisted: PersistedRules = serde_json::from_str(&text)?;
        let mut rules = self.rules.write().unwrap();
        let mut index = self.device_index.write().unwrap();
        for rule in persisted.rules {
            for device_id in rule.trigger_device_ids() {
                index.entry(device_id).or_default().insert(rule.rule_id.clone());
            }
            rules.insert(rule.rule_id.clone(), rule);
        }
        info!(count = rules.len(), "loaded automation rules");
        Ok(())
    }

    fn save(&self) -> anyhow::Result<()> {
        let persisted = PersistedRules {
            version: 1,
            updated_at: now_secs(),
            rules: self.rules.read().unwrap().values().cloned().collect(),
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

    pub fn add_rule(&self, rule: AutomationRule) -> anyhow::Result<()> {
        let mut rules = self.rules.write().unwrap();
        if rules.contains_key(&rule.rule_id) {
            anyhow::bail!("rule '{}' already exists", rule.rule_id);
        }
        let mut index = self.device_index.write().unwrap();
        for device_id in rule.trigger_device_ids() {
            index.entry(device_id).or_default().insert(rule.rule_id.clone());
        }
        rules.insert(rule.rule_id.clone(), rule);
        drop(rules);
        drop(index);
        self.save()
    }

    pub fn remove_rule(&self, rule_id: &str) -> anyhow::Result<bool> {
        let mut rules = self.rules.write().unwrap();
        let Some(rule) = rules.remove(rule_id) else { return Ok(false) };
        let mut index = self.device_index.write().unwrap();
        for device_id in rule.trigger_device_ids() {
            if let Some(set) = index.get_mut(&device_id) {
                set.remove(rule_id);
            }
        }
        drop(rules);
        drop(index);
        self.save()?;
        Ok(true)
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<AutomationRule> {
        self.rules.read().unwrap().get(rule_id).cloned()
    }

    pub fn list_rules(&self) -> Vec<AutomationRule> {
        self.rules.read().unwrap().values().cloned().collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> anyhow::Result<bool> {
        let found = {
            let mut rules = self.rules.write().unwrap();
            match rules.get_mut(rule_id) {
                Some(rule) => {
                    rule.enabled = enabled;
                    true
                }
                None => false,
            }
        };
        if found {
            self.save()?;
        }
        Ok(found)
    }

    /// Evaluate every rule triggered by `trigger_device_id`'s state change,
    /// returning the commands to dispatch. Rules whose conditions aren't
    /// all satisfied, or that are disabled or in cooldown, are skipped.
    pub fn evaluate(&self, trigger_device_id: &str, registry: &Registry, now: f64) -> Vec<DeviceCommand> {
        let mut commands = Vec::new();
        let rule_ids: Vec<String> = {
            let index = self.device_index.read().unwrap();
            match index.get(trigger_device_id) {
                Some(set) => set.iter().cloned().collect(),
                None => return commands,
            }
        };

        let mut rules = self.rules.write().unwrap();
        for rule_id in rule_ids {
            let Some(rule) = rules.get_mut(&rule_id) else { continue };
            if !rule.enabled {
                continue;
            }
            if rule.last_triggered != 0.0 && (now - rule.last_triggered) < rule.cooldown_seconds as f64 {
                debug!(rule = %rule.rule_id, "skipped: cooldown not elapsed");
                continue;
            }
            if evaluate_conditions(rule, registry) {
                info!(rule = %rule.rule_id, name = %rule.name, "automation rule fired");
                rule.last_triggered = now;
                for action in &rule.actions {
                    commands.push(action.to_command());
                }
            }
        }
        drop(rules);
        if !commands.is_empty() {
            if let Err(e) = self.save() {
                warn!(error = %e, "failed to persist rule trigger timestamps");
            }
        }
        commands
    }

    /// Markdown summary of currently enabled rules, for the agent-facing
    /// context contract.
    pub fn describe_rules(&self) -> String {
        let rules = self.rules.read().unwrap();
        let enabled: Vec<_> = rules.values().filter(|r| r.enabled).collect();
        if enabled.is_empty() {
            return "No active automation rules.".to_string();
        }
        let mut lines = vec![format!("Active automation rules ({}):", enabled.len())];
        for rule in enabled {
            let conditions_str = rule
                .conditions
                .iter()
                .map(|c| format!("{}.{} {:?} {}", c.device_id, c.capability, c.operator, c.value))
                .collect::<Vec<_>>()
                .join(" AND ");
            let actions_str = rule
                .actions
                .iter()
                .map(|a| format!("{:?} {}.{}", a.action, a.device_id, a.capability))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!(
                "  - [{}] \"{}\": IF {conditions_str} THEN {actions_str} (cooldown: {}s)",
                rule.rule_id, rule.name, rule.cooldown_seconds
            ));
        }
        lines.join("\n")
    }
}

fn evaluate_conditions(rule: &AutomationRule, registry: &Registry) -> bool {
    rule.conditions.iter().all(|cond| check_condition(cond, registry))
}

fn check_condition(cond: &Condition, registry: &Registry) -> bool {
    let Some(device) = registry.get(&cond.device_id) else { return false };
    let Some(current_value) = device.state.get(&cond.capability) else { return false };
    cond.operator.apply(current_value, &cond.value)
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshhub_core::device::{Capability, CapabilityKind, Device, ValueType};
    use std::collections::HashMap as StdHashMap;
    use tempfile::tempdir;

    fn registry_with_sensor_and_ac(dir: &std::path::Path) -> Registry {
        let registry = Registry::load(dir.join("registry.json")).unwrap();
        let mut sensor = Device::new("sensor-01", "temp_sensor");
        sensor.capabilities.push(Capability {
            name: "temperature".into(),
            cap_type: CapabilityKind::Sensor,
            data_type: ValueType::Float,
            ..Default::default()
        });
        registry.register(sensor).unwrap();
        let mut ac = Device::new("ac-01", "ac_unit");
        ac.capabilities.push(Capability {
            name: "power".into(),
            cap_type: CapabilityKind::Actuator,
            data_type: ValueType::Bool,
            ..Default::default()
        });
        registry.register(ac).unwrap();
        registry
    }

    #[test]
    fn rule_fires_when_threshold_crossed_then_respects_cooldown() {
        let dir = tempdir().unwrap();
        let registry = registry_with_sensor_and_ac(dir.path());
        let engine = AutomationEngine::new(dir.path().join("rules.json"));
        engine
            .add_rule(AutomationRule {
                rule_id: "temp-ac".into(),
                name: "Cool when hot".into(),
                description: String::new(),
                enabled: true,
                conditions: vec![Condition {
                    device_id: "sensor-01".into(),
                    capability: "temperature".into(),
                    operator: ComparisonOp::Gt,
                    value: serde_json::json!(30),
                }],
                actions: vec![RuleAction {
                    device_id: "ac-01".into(),
                    capability: "power".into(),
                    action: Action::Set,
                    params: StdHashMap::from([("value".to_string(), serde_json::json!(true))]),
                }],
                cooldown_seconds: 60,
                last_triggered: 0.0,
            })
            .unwrap();

        let mut state = StdHashMap::new();
        state.insert("temperature".to_string(), serde_json::json!(32.0));
        registry.update_state("sensor-01", state).unwrap();

        let commands = engine.evaluate("sensor-01", &registry, 1000.0);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].device, "ac-01");

        // Cooldown not yet elapsed: no re-fire.
        let commands = engine.evaluate("sensor-01", &registry, 1010.0);
        assert!(commands.is_empty());

        // Cooldown elapsed: fires again.
        let commands = engine.evaluate("sensor-01", &registry, 1065.0);
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn rule_does_not_fire_when_condition_unmet() {
        let dir = tempdir().unwrap();
        let registry = registry_with_sensor_and_ac(dir.path());
        let engine = AutomationEngine::new(dir.path().join("rules.json"));
        engine
            .add_rule(AutomationRule {
                rule_id: "temp-ac".into(),
                name: "Cool when hot".into(),
                description: String::new(),
                enabled: true,
                conditions: vec![Condition {
                    device_id: "sensor-01".into(),
                    capability: "temperature".into(),
                    operator: ComparisonOp::Gt,
                    value: serde_json::json!(30),
                }],
                actions: vec![RuleAction {
                    device_id: "ac-01".into(),
                    capability: "power".into(),
                    action: Action::Set,
                    params: StdHashMap::from([("value".to_string(), serde_json::json!(true))]),
                }],
                cooldown_seconds: 60,
                last_triggered: 0.0,
            })
            .unwrap();

        let mut state = StdHashMap::new();
        state.insert("temperature".to_string(), serde_json::json!(20.0));
        registry.update_state("sensor-01", state).unwrap();

        assert!(engine.evaluate("sensor-01", &registry, 1000.0).is_empty());
    }

    #[test]
    fn validate_rejects_unknown_device() {
        let dir = tempdir().unwrap();
        let registry = registry_with_sensor_and_ac(dir.path());
        let rule = AutomationRule {
            rule_id: "r1".into(),
            name: "x".into(),
            description: String::new(),
            enabled: true,
            conditions: vec![Condition {
                device_id: "ghost".into(),
                capability: "temperature".into(),
                operator: ComparisonOp::Gt,
                value: serde_json::json!(1),
            }],
            actions: vec![RuleAction {
                device_id: "ac-01".into(),
                capability: "power".into(),
                action: Action::Set,
                params: StdHashMap::new(),
            }],
            cooldown_seconds: 60,
            last_triggered: 0.0,
        };
        let errors = validate_rule(&rule, &registry);
        assert!(errors.iter().any(|e| e.contains("ghost")));
    }
}
