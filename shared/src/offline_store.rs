//! Durable local slots for the preference engine.
//!
//! Two whole-object snapshots live here: the anonymous guest copy of the
//! preferences and the single pending write that could not reach the
//! server. Each slot is wrapped in a checksummed, versioned envelope so a
//! torn or foreign write is detected and dropped instead of crashing the
//! map on startup.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capabilities::kv::{KeyNamespace, KvError, KvKey, LocalPersistence};
use crate::config::SyncConfig;
use crate::model::MapLayerPreferences;
use crate::UnixTimeMs;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_SNAPSHOT_BYTES: usize = 256 * 1024;
const SNAPSHOT_MAGIC: &[u8; 4] = b"MLPS";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted snapshot: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("snapshot too large: {size} bytes, max {max}")]
    SnapshotTooLarge { size: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

/// The single outstanding unsent snapshot. Overwritten, never queued.
///
/// `owner` is the [`AuthToken::owner_id`](crate::AuthToken::owner_id) of the
/// session that recorded it. Slots written without one belong to nobody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub preferences: MapLayerPreferences,
    pub recorded_at: UnixTimeMs,
    #[serde(default)]
    pub owner: String,
}

impl PendingWrite {
    #[must_use]
    pub fn new(preferences: MapLayerPreferences, owner: impl Into<String>) -> Self {
        Self {
            preferences,
            recorded_at: UnixTimeMs::now(),
            owner: owner.into(),
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        !self.owner.is_empty() && self.owner == owner
    }
}

pub fn encode_snapshot<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let envelope = SnapshotEnvelope {
        magic: *SNAPSHOT_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *blake3::hash(&payload).as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;

    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(StoreError::SnapshotTooLarge {
            size: bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }
    Ok(bytes)
}

/// Decodes an envelope. Schema 0 is a bare JSON document, which is what
/// shells wrote before the envelope existed.
pub fn decode_snapshot<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty snapshot",
        });
    }
    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(StoreError::SnapshotTooLarge {
            size: bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }

    if matches!(bytes.first(), Some(b'{')) {
        return migrate_v0(bytes);
    }

    let envelope: SnapshotEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *SNAPSHOT_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    Ok(ciborium::from_reader(&envelope.payload[..])?)
}

fn migrate_v0<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Typed access to the guest and pending slots over any [`LocalPersistence`].
pub struct LocalPreferenceStore<S> {
    storage: S,
    guest_key: KvKey,
    pending_key: KvKey,
}

impl<S: LocalPersistence> LocalPreferenceStore<S> {
    pub fn new(storage: S, config: &SyncConfig) -> Result<Self, StoreError> {
        Ok(Self {
            storage,
            guest_key: KvKey::new(KeyNamespace::Preferences, &config.guest_preferences_key)?,
            pending_key: KvKey::new(KeyNamespace::Sync, &config.pending_write_key)?,
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn load_guest(&self) -> Option<MapLayerPreferences> {
        self.read_slot(&self.guest_key)
    }

    pub fn save_guest(&self, preferences: &MapLayerPreferences) -> Result<(), StoreError> {
        self.write_slot(&self.guest_key, preferences)
    }

    pub fn clear_guest(&self) -> Result<(), StoreError> {
        Ok(self.storage.delete(&self.guest_key)?)
    }

    pub fn load_pending(&self) -> Option<PendingWrite> {
        self.read_slot(&self.pending_key)
    }

    pub fn save_pending(&self, pending: &PendingWrite) -> Result<(), StoreError> {
        self.write_slot(&self.pending_key, pending)
    }

    pub fn clear_pending(&self) -> Result<(), StoreError> {
        Ok(self.storage.delete(&self.pending_key)?)
    }

    /// Unreadable slots are logged and removed; callers only see "absent".
    fn read_slot<T: DeserializeOwned>(&self, key: &KvKey) -> Option<T> {
        let bytes = match self.storage.get(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(
                    key = %key.raw(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "local slot read failed"
                );
                return None;
            }
        };

        match decode_snapshot(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key.raw(), error = %e, "discarding unreadable local slot");
                if let Err(e) = self.storage.delete(key) {
                    debug!(key = %key.raw(), error = %e, "could not remove unreadable slot");
                }
                None
            }
        }
    }

    fn write_slot<T: Serialize>(&self, key: &KvKey, value: &T) -> Result<(), StoreError> {
        let bytes = encode_snapshot(value)?;
        self.storage.set(key, &bytes)?;
        Ok(())
    }
}
