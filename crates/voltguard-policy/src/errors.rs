//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Voltage protection policy engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;
use voltguard_common::ConfigError;
use voltguard_persistence::PersistenceError;
use voltguard_rt::WorkerError;

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ConfigError),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl From<WorkerError> for PolicyError {
    fn from(err: WorkerError) -> Self {
        PolicyError::InvalidState(err.to_string())
    }
}
