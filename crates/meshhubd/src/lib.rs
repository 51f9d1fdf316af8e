//! meshhubd - LAN Mesh Hub daemon
//!
//! This daemon provides:
//! - Device registry and capability-aware command validation
//! - Condition/action automation rules
//! - Over-the-air firmware delivery
//! - Device groups and scenes
//! - Hub-to-hub federation
//! - Sensor reading aggregation

pub mod automation;
pub mod config;
pub mod federation;
pub mod groups;
pub mod hub;
pub mod ota;
pub mod pipeline;
pub mod registry;
pub mod resilience;

pub use config::Config;
pub use hub::Hub;
pub use registry::Registry;
