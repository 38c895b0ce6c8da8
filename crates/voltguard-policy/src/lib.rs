//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Voltage protection policy engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Brownout protection for VoltGuard.
//!
//! [`PowerPolicy`] reads the sampling engine's cached voltage once per tick and drives a
//! five-state hysteresis machine: NORMAL, LOW_VOLTAGE, SHUTDOWN, PROTECTED and RECOVERY.
//! Hardware side effects go through the [`DevicePlatform`] and [`ProcessControl`] seams so
//! the machine can be exercised without a board.

pub mod engine;
pub mod errors;
pub mod events;
pub mod platform;
pub mod state;
pub mod store;

pub use engine::{PolicyCollaborators, PowerPolicy};
pub use errors::{PolicyError, Result};
pub use events::{PolicyEvent, PolicyEventKind};
pub use platform::{DevicePlatform, ManagedDevice, PlatformError, ProcessControl, VoltageSource};
pub use state::{DeviceStatus, PolicyStatus, ProtectionState};
pub use store::{ConfigStore, POLICY_NAMESPACE};
