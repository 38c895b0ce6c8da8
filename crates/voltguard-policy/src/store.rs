//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Voltage protection policy engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use voltguard_common::PolicyConfig;
use voltguard_persistence::{NamespaceStore, PersistenceError};

/// Namespace holding the persisted [`PolicyConfig`].
pub const POLICY_NAMESPACE: &str = "power_policy";

/// Load/save seam for the policy configuration. `Ok(None)` means nothing was saved yet.
pub trait ConfigStore: Send + Sync {
    fn load_policy(&self) -> Result<Option<PolicyConfig>, PersistenceError>;
    fn save_policy(&self, config: &PolicyConfig) -> Result<(), PersistenceError>;
}

impl ConfigStore for NamespaceStore {
    fn load_policy(&self) -> Result<Option<PolicyConfig>, PersistenceError> {
        self.load(POLICY_NAMESPACE)
    }

    fn save_policy(&self, config: &PolicyConfig) -> Result<(), PersistenceError> {
        self.save(POLICY_NAMESPACE, config)
    }
}
