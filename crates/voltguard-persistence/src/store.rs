//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{PersistenceError, Result};

/// Current record envelope version.
pub const RECORD_VERSION: u16 = 1;

const MAX_NAMESPACE_LEN: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordEnvelope {
    version: u16,
    namespace: String,
    saved_at: DateTime<Utc>,
    hash: String,
    payload: serde_json::Value,
}

/// Directory-backed store holding one JSON record per namespace.
///
/// Records are written to a temporary sibling and renamed into place, so a crash
/// mid-write leaves the previous record intact.
#[derive(Debug, Clone)]
pub struct NamespaceStore {
    root: PathBuf,
}

impl NamespaceStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding the namespace files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str) -> Result<PathBuf> {
        validate_namespace(namespace)?;
        Ok(self.root.join(format!("{namespace}.json")))
    }

    /// Load the record stored under `namespace`.
    ///
    /// Returns `Ok(None)` when nothing has been saved yet.
    pub fn load<T: DeserializeOwned>(&self, namespace: &str) -> Result<Option<T>> {
        let path = self.path_for(namespace)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(namespace, "no stored record");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let envelope: RecordEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version != RECORD_VERSION {
            return Err(PersistenceError::UnsupportedVersion(envelope.version));
        }
        if envelope.namespace != namespace {
            return Err(PersistenceError::NamespaceMismatch {
                expected: namespace.to_owned(),
                found: envelope.namespace,
            });
        }
        if compute_hash(&envelope.payload)? != envelope.hash {
            return Err(PersistenceError::HashMismatch(namespace.to_owned()));
        }
        Ok(Some(serde_json::from_value(envelope.payload)?))
    }

    /// Store `value` under `namespace`, replacing any previous record.
    pub fn save<T: Serialize>(&self, namespace: &str, value: &T) -> Result<()> {
        let path = self.path_for(namespace)?;
        let payload = serde_json::to_value(value)?;
        let envelope = RecordEnvelope {
            version: RECORD_VERSION,
            namespace: namespace.to_owned(),
            saved_at: Utc::now(),
            hash: compute_hash(&payload)?,
            payload,
        };

        let staging = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer_pretty(&mut writer, &envelope)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&staging, &path)?;
        debug!(namespace, path = %path.display(), "record saved");
        Ok(())
    }

    /// Check whether the record under `namespace` exists and passes its integrity check.
    pub fn verify(&self, namespace: &str) -> bool {
        matches!(self.load::<serde_json::Value>(namespace), Ok(Some(_)))
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace.len() <= MAX_NAMESPACE_LEN
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidNamespace(namespace.to_owned()))
    }
}

fn compute_hash(payload: &serde_json::Value) -> Result<String> {
    let serialized = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}
