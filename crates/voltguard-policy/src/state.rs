//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Voltage protection policy engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Protection machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionState {
    #[default]
    Normal,
    LowVoltage,
    Shutdown,
    Protected,
    Recovery,
}

impl ProtectionState {
    /// Stable identifier for logs and transports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionState::Normal => "NORMAL",
            ProtectionState::LowVoltage => "LOW_VOLTAGE",
            ProtectionState::Shutdown => "SHUTDOWN",
            ProtectionState::Protected => "PROTECTED",
            ProtectionState::Recovery => "RECOVERY",
        }
    }

    /// Operator-facing description.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProtectionState::Normal => "normal operation",
            ProtectionState::LowVoltage => "low voltage countdown",
            ProtectionState::Shutdown => "shutting down",
            ProtectionState::Protected => "protected",
            ProtectionState::Recovery => "voltage recovering",
        }
    }
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power and connectivity of the two managed devices, as last reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_a_powered: bool,
    pub device_b_powered: bool,
    pub device_a_connected: bool,
    pub device_b_connected: bool,
    pub device_a_disconnect_secs: u64,
    pub device_b_disconnect_secs: u64,
}

/// Point-in-time view of the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyStatus {
    pub state: ProtectionState,
    pub state_name: &'static str,
    pub running: bool,
    pub current_voltage: f64,
    pub countdown_remaining_secs: u32,
    pub recovery_timer_remaining_secs: u32,
    pub fan_stop_remaining_secs: u32,
    pub protection_count: u32,
    pub uptime_ms: u64,
    pub device_status: DeviceStatus,
    pub test_mode: bool,
    pub debug_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_as_wire_names() {
        let json = serde_json::to_string(&ProtectionState::LowVoltage).unwrap();
        assert_eq!(json, "\"LOW_VOLTAGE\"");
        assert_eq!(ProtectionState::Recovery.to_string(), "RECOVERY");
        assert_eq!(ProtectionState::default(), ProtectionState::Normal);
    }
}
