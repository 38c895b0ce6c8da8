//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Small key/value settings store used to persist engine configuration across restarts.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing namespace files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when a stored record fails integrity verification.
    #[error("record hash mismatch in namespace {0}")]
    HashMismatch(String),
    /// Namespace names are limited to 15 characters of `[A-Za-z0-9_-]`.
    #[error("invalid namespace name: {0:?}")]
    InvalidNamespace(String),
    /// The envelope on disk was written for a different namespace.
    #[error("namespace mismatch: expected {expected}, found {found}")]
    NamespaceMismatch {
        /// Namespace requested by the caller.
        expected: String,
        /// Namespace recorded in the file.
        found: String,
    },
    /// The envelope was written by an incompatible store version.
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u16),
}

/// Namespace-keyed record store.
pub mod store;

pub use store::{NamespaceStore, RECORD_VERSION};
