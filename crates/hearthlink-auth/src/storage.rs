//! Persistent storage for the identity directory
//!
//! The directory is a single `users:` document. Files ending in `.yaml` or
//! `.yml` are read and written as YAML, anything else as JSON. Saves go
//! through a temporary file and a rename so a crash never leaves a
//! half-written directory behind.

use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Configuration directory not found")]
    NoConfigDir,
    #[error("Save rejected: {0}")]
    Rejected(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Where the identity list is loaded from and saved to
pub trait DirectoryStore: Send + Sync {
    /// Load all identities in declaration order
    fn load(&self) -> StorageResult<Vec<Identity>>;

    /// Replace the stored identities with `identities`
    fn save(&self, identities: &[Identity]) -> StorageResult<()>;
}

/// On-disk document layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UsersDocument {
    #[serde(default)]
    users: Vec<Identity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            _ => FileFormat::Json,
        }
    }
}

/// File-backed directory store
pub struct FileStore {
    path: PathBuf,
    format: FileFormat,
}

impl FileStore {
    /// Store at a specific path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = FileFormat::for_path(&path);
        Self { path, format }
    }

    /// Get the default storage path (~/.config/hearthlink/users.yaml)
    pub fn default_path() -> StorageResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(config_dir.join("hearthlink").join("users.yaml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, identities: &[Identity]) -> StorageResult<String> {
        let doc = UsersDocument {
            users: identities.to_vec(),
        };
        Ok(match self.format {
            FileFormat::Yaml => serde_yaml::to_string(&doc)?,
            FileFormat::Json => serde_json::to_string_pretty(&doc)?,
        })
    }

    fn decode(&self, contents: &str) -> StorageResult<UsersDocument> {
        if contents.trim().is_empty() {
            return Ok(UsersDocument::default());
        }
        Ok(match self.format {
            FileFormat::Yaml => serde_yaml::from_str(contents)?,
            FileFormat::Json => serde_json::from_str(contents)?,
        })
    }
}

impl DirectoryStore for FileStore {
    fn load(&self) -> StorageResult<Vec<Identity>> {
        if !self.path.exists() {
            debug!("No user directory at {:?}, starting empty", self.path);
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let doc = self.decode(&contents)?;
        info!("Loaded {} users from {:?}", doc.users.len(), self.path);
        Ok(doc.users.into_iter().map(Identity::normalized).collect())
    }

    fn save(&self, identities: &[Identity]) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let encoded = self.encode(identities)?;
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        std::fs::write(&tmp_path, encoded)?;
        std::fs::rename(&tmp_path, &self.path)?;
        debug!("Saved user directory to {:?}", self.path);
        Ok(())
    }
}

/// In-memory store, mainly for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<Vec<Identity>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new(users: Vec<Identity>) -> Self {
        Self {
            users: Mutex::new(users),
            ..Default::default()
        }
    }

    /// Make subsequent saves fail (or succeed again)
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// What was last saved (or the initial list)
    pub fn stored(&self) -> Vec<Identity> {
        self.users
            .lock()
            .map(|users| users.clone())
            .unwrap_or_default()
    }
}

impl DirectoryStore for MemoryStore {
    fn load(&self) -> StorageResult<Vec<Identity>> {
        Ok(self.stored())
    }

    fn save(&self, identities: &[Identity]) -> StorageResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected("store is read-only".to_string()));
        }
        let mut users = self
            .users
            .lock()
            .map_err(|_| StorageError::Rejected("store lock poisoned".to_string()))?;
        *users = identities.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearthlink_core::protocol::Role;
    use hearthlink_core::MacAddress;
    use tempfile::tempdir;

    fn sample() -> Vec<Identity> {
        vec![
            Identity::new("home:dad", "Dad", "1111", "main", Role::Admin).with_passphrase("kettle"),
            Identity::new("home:kid", "Kid", "2222", "tutor", Role::Child)
                .with_mac(MacAddress::parse("aa:bb:cc:dd:ee:ff").unwrap())
                .with_mac_required(true),
        ]
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.yaml");

        let store = FileStore::with_path(&path);
        store.save(&sample()).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("macRequired: true"));
        assert!(!dir.path().join("users.yaml.tmp").exists());

        let loaded = FileStore::with_path(&path).load().unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("users.json");

        let store = FileStore::with_path(&path);
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::with_path(dir.path().join("absent.yaml"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_hand_written_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.yml");
        std::fs::write(
            &path,
            "users:\n  - id: home:mum\n    name: Mum\n    pin: 3456\n    mac: [AA-BB-CC-DD-EE-01]\n    agent: main\n    role: parent\n    passphrase: ''\n",
        )
        .unwrap();

        let loaded = FileStore::with_path(&path).load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].mac[0].as_str(), "aa:bb:cc:dd:ee:01");
        assert!(loaded[0].passphrase.is_none());
    }

    #[test]
    fn test_memory_store_failure() {
        let store = MemoryStore::new(sample());
        store.set_fail_saves(true);
        assert!(store.save(&[]).is_err());
        assert_eq!(store.stored().len(), 2);

        store.set_fail_saves(false);
        store.save(&[]).unwrap();
        assert!(store.stored().is_empty());
        assert_eq!(store.save_count(), 1);
    }
}
