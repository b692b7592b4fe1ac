//! Persisted snapshot of the key store.
//!
//! The snapshot is a single JSON document holding every record, private
//! material included. It is always read and written whole.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::JwksError;

use super::keys::{KeyAlgorithm, KeyRecord, KeyState, KeyUsage, Keypair};
use super::store::KeyStore;

/// Load/save access to the snapshot resource.
///
/// Implementations may block; the lifecycle manager calls them from the
/// blocking thread pool.
pub trait SnapshotStore: Send + Sync {
    /// Reads the full store.
    ///
    /// # Errors
    ///
    /// [`JwksError::StoreMissing`] when no snapshot exists,
    /// [`JwksError::StoreCorrupt`] when it cannot be decoded, and
    /// [`JwksError::StoreIo`] for any other read failure.
    fn load(&self) -> Result<KeyStore, Report<JwksError>>;

    /// Replaces the snapshot with `store`.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::StoreIo`] if the snapshot cannot be written.
    fn save(&self, store: &KeyStore) -> Result<(), Report<JwksError>>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    keys: Vec<StoredKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    kid: String,
    alg: KeyAlgorithm,
    #[serde(rename = "use")]
    usage: KeyUsage,
    state: KeyState,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retire_at: Option<DateTime<Utc>>,
    x: String,
    d: String,
}

impl From<&KeyRecord> for StoredKey {
    fn from(record: &KeyRecord) -> Self {
        Self {
            kid: record.kid.clone(),
            alg: record.algorithm,
            usage: record.usage,
            state: record.state,
            created_at: record.created_at,
            retire_at: record.retire_at,
            x: URL_SAFE_NO_PAD.encode(record.keypair.verifying_key.as_bytes()),
            d: URL_SAFE_NO_PAD.encode(record.keypair.signing_key.to_bytes()),
        }
    }
}

impl StoredKey {
    fn into_record(self) -> Result<KeyRecord, Report<JwksError>> {
        let corrupt = |message: String| JwksError::StoreCorrupt { message };

        let seed: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&self.d)
            .change_context_lazy(|| corrupt(format!("key '{}' has undecodable 'd'", self.kid)))?
            .try_into()
            .map_err(|_| {
                Report::new(corrupt(format!(
                    "key '{}' seed must be 32 bytes",
                    self.kid
                )))
            })?;

        if self.state == KeyState::Retiring && self.retire_at.is_none() {
            return Err(Report::new(corrupt(format!(
                "retiring key '{}' has no 'retire_at'",
                self.kid
            ))));
        }

        let keypair = Keypair::from_seed(&seed);
        if URL_SAFE_NO_PAD.encode(keypair.verifying_key.as_bytes()) != self.x {
            return Err(Report::new(corrupt(format!(
                "key '{}' public key does not match its seed",
                self.kid
            ))));
        }

        Ok(KeyRecord {
            kid: self.kid,
            algorithm: self.alg,
            usage: self.usage,
            state: self.state,
            created_at: self.created_at,
            retire_at: self.retire_at,
            keypair,
        })
    }
}

/// Serializes the full store.
///
/// # Errors
///
/// Returns [`JwksError::StoreIo`] if serialization fails.
pub fn encode_snapshot(store: &KeyStore) -> Result<String, Report<JwksError>> {
    let document = SnapshotDocument {
        keys: store.all().iter().map(StoredKey::from).collect(),
    };

    serde_json::to_string_pretty(&document).change_context(JwksError::StoreIo {
        message: "Failed to serialize key store".into(),
    })
}

/// Parses and checks a snapshot document.
///
/// # Errors
///
/// Returns [`JwksError::StoreCorrupt`] if the document is not valid JSON,
/// holds invalid key material, has a retiring key without a deletion time,
/// repeats a key identifier, or has more than one active key.
pub fn decode_snapshot(contents: &str) -> Result<KeyStore, Report<JwksError>> {
    let document: SnapshotDocument =
        serde_json::from_str(contents).change_context(JwksError::StoreCorrupt {
            message: "snapshot is not a valid key store document".into(),
        })?;

    let mut store = KeyStore::default();
    for stored in document.keys {
        if store.contains(&stored.kid) {
            return Err(Report::new(JwksError::StoreCorrupt {
                message: format!("duplicate key identifier '{}'", stored.kid),
            }));
        }
        store.append(stored.into_record()?);
    }

    let active = store.in_state(KeyState::Active).count();
    if active > 1 {
        return Err(Report::new(JwksError::StoreCorrupt {
            message: format!("{active} keys are marked active"),
        }));
    }

    Ok(store)
}

/// Snapshot kept in a single JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> &Path {
        self.path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<KeyStore, Report<JwksError>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Report::new(JwksError::StoreMissing {
                    path: self.location(),
                }));
            }
            Err(e) => {
                return Err(Report::new(e).change_context(JwksError::StoreIo {
                    message: format!("Failed to read {}", self.location()),
                }));
            }
        };

        decode_snapshot(&contents).attach(format!("while loading {}", self.location()))
    }

    fn save(&self, store: &KeyStore) -> Result<(), Report<JwksError>> {
        let contents = encode_snapshot(store)?;
        let write_error = || JwksError::StoreIo {
            message: format!("Failed to write {}", self.location()),
        };

        // Created owner-only (0600) next to the target so the rename stays on
        // one filesystem.
        let mut temp = NamedTempFile::new_in(self.directory()).change_context_lazy(write_error)?;
        temp.write_all(contents.as_bytes())
            .change_context_lazy(write_error)?;
        temp.as_file().sync_all().change_context_lazy(write_error)?;

        // Readers of the file see either the old or the new document.
        temp.persist(&self.path)
            .change_context_lazy(|| JwksError::StoreIo {
                message: format!("Failed to replace {}", self.location()),
            })?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
