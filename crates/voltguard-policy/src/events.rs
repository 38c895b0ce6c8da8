//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Voltage protection policy engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::Serialize;

use crate::state::{PolicyStatus, ProtectionState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyEventKind {
    StateChanged {
        from: ProtectionState,
        to: ProtectionState,
    },
    LowVoltage { voltage: f64 },
    CountdownTick { remaining_secs: u32 },
    ShutdownStart,
    Protected,
    RecoveryStart { voltage: f64 },
    RecoveryTick { remaining_secs: u32 },
    /// Emitted right before the restart request.
    RecoveryComplete,
    TestTriggered { simulated_voltage: f64 },
    DebugTick,
}

/// Event plus the engine status captured when it was committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyEvent {
    #[serde(flatten)]
    pub kind: PolicyEventKind,
    pub status: PolicyStatus,
}
