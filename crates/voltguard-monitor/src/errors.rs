//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sampling and telemetry protocol engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;
use voltguard_common::ConfigError;
use voltguard_rt::WorkerError;

use crate::hal::HalError;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ConfigError),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("hardware error: {0}")]
    Hardware(#[from] HalError),
    #[error("{0} not available yet")]
    NotAvailable(&'static str),
}

impl From<WorkerError> for MonitorError {
    fn from(err: WorkerError) -> Self {
        MonitorError::InvalidState(err.to_string())
    }
}
