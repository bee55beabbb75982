use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path segments".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Preferences,
    Sync,
}

impl KeyNamespace {
    pub fn prefix(self) -> &'static str {
        match self {
            KeyNamespace::Preferences => "prefs",
            KeyNamespace::Sync => "sync",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Storage { retryable: true, .. })
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            ErrorKind::PermissionDenied => StorageErrorCode::PermissionDenied,
            ErrorKind::WouldBlock | ErrorKind::Interrupted => StorageErrorCode::Busy,
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => StorageErrorCode::Corrupted,
            _ => StorageErrorCode::IoError,
        };
        KvError::storage(code, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Corrupted,
    PermissionDenied,
    Busy,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(self, StorageErrorCode::Busy)
    }
}

/// Durable device-local storage. Values are whole snapshots; there are no
/// partial updates at this layer. Calls are synchronous, like browser
/// local storage.
pub trait LocalPersistence: Send + Sync {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError>;
    fn delete(&self, key: &KvKey) -> Result<(), KvError>;
}

impl<T: LocalPersistence + ?Sized> LocalPersistence for Arc<T> {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        (**self).get(key)
    }

    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &KvKey) -> Result<(), KvError> {
        (**self).delete(key)
    }
}

fn check_value_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Process-local storage, used by the web shell bridge and by tests.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &KvKey) -> bool {
        self.lock().contains_key(&key.raw())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LocalPersistence for MemoryKv {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.lock().get(&key.raw()).cloned())
    }

    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_value_size(value)?;
        self.lock().insert(key.raw(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &KvKey) -> Result<(), KvError> {
        self.lock().remove(&key.raw());
        Ok(())
    }
}

/// One file per key under a root directory. Writes go to a temporary file
/// that is synced and renamed over the target.
#[derive(Debug, Clone)]
pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, KvError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &KvKey) -> PathBuf {
        let file_name: String = key
            .raw()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{file_name}.bin"))
    }
}

impl LocalPersistence for FileKv {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_value_size(value)?;
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(value)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &path)?;

        if let Ok(dir) = File::open(&self.root) {
            let _ = dir.sync_all();
        }

        Ok(())
    }

    fn delete(&self, key: &KvKey) -> Result<(), KvError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
