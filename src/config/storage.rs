//! Configuration Storage
//!
//! Handles reading/writing configuration and local state files to disk.
//! Config location: ~/.panelterm on macOS/Linux, %APPDATA%\PanelTerm on Windows

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{TerminalConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the PanelTerm configuration directory
/// Returns %APPDATA%\PanelTerm on Windows, ~/.panelterm on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("PanelTerm"));
        }
        dirs::home_dir()
            .map(|home| home.join(".panelterm"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".panelterm"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the terminal config file path
pub fn terminal_config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("terminal.json"))
}

/// Get the local state file path (history, display prefs, reattach keys)
pub fn local_state_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("state.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: terminal_config_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load configuration from disk
    /// Returns default config if file doesn't exist
    /// If config is corrupted, creates a backup and returns default config
    pub async fn load(&self) -> Result<TerminalConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<TerminalConfig>(&contents) {
                Ok(config) => {
                    if config.version > CONFIG_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: config.version,
                            supported: CONFIG_VERSION,
                        });
                    }
                    Ok(config)
                }
                Err(e) => {
                    tracing::warn!("Terminal config corrupted: {}", e);

                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted config backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted config: {}", backup_err);
                        }
                    }

                    Ok(TerminalConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TerminalConfig::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save configuration to disk
    pub async fn save(&self, config: &TerminalConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Create a backup of the current config
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = self
            .path
            .with_extension(format!("json.backup.{}", timestamp));

        if fs::try_exists(&self.path).await? {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Small string key/value store for client-side state.
///
/// Every mutation is written through to disk (temp file + rename). A store
/// without a path lives in memory only. Reads never fail: a missing or
/// corrupt file yields an empty store.
pub struct LocalStore {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, String>>,
}

impl LocalStore {
    /// Open the store at the default location
    pub fn open_default() -> Result<Self, StorageError> {
        Ok(Self::open(local_state_file()?))
    }

    /// Open a file-backed store
    pub fn open(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, String>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("Local state {:?} corrupted, starting empty: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Failed to read local state {:?}: {}", path, e);
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            entries: RwLock::new(entries),
        }
    }

    /// Create a store that is never persisted
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<(), StorageError> {
        let snapshot = {
            let mut entries = self.entries.write();
            entries.insert(key.to_string(), value.into());
            entries.clone()
        };
        self.flush(&snapshot)
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        let snapshot = {
            let mut entries = self.entries.write();
            if entries.remove(key).is_none() {
                return Ok(());
            }
            entries.clone()
        };
        self.flush(&snapshot)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string(entries)?;
        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let dir = tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("terminal.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.keepalive_secs, 25);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("terminal.json"));

        let mut config = TerminalConfig::default();
        config.server.base_url = "http://192.168.1.1:8088".to_string();
        config.tab_id = "tab-7".to_string();
        storage.save(&config).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.server.base_url, "http://192.168.1.1:8088");
        assert_eq!(loaded.tab_id, "tab-7");
    }

    #[tokio::test]
    async fn test_corrupted_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("terminal.json");
        std::fs::write(&path, "{ not json").unwrap();

        let storage = ConfigStorage::with_path(path);
        let config = storage.load().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_version_too_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("terminal.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();

        let storage = ConfigStorage::with_path(path);
        assert!(matches!(
            storage.load().await,
            Err(StorageError::VersionTooNew { found: 99, .. })
        ));
    }

    #[test]
    fn test_local_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = LocalStore::open(path.clone());
        store.set("term_font_size_v1", "14").unwrap();
        store.set("other", "x").unwrap();
        store.remove("other").unwrap();

        let reopened = LocalStore::open(path);
        assert_eq!(reopened.get("term_font_size_v1").as_deref(), Some("14"));
        assert!(!reopened.contains("other"));
    }

    #[test]
    fn test_local_store_corrupt_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "[1, 2").unwrap();

        let store = LocalStore::open(path);
        assert!(store.get("anything").is_none());
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_in_memory_store() {
        let store = LocalStore::in_memory();
        assert!(store.path().is_none());
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").as_deref(), Some("1"));
    }
}
