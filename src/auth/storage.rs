// Durable storage for the access token.
// Writes a single JSON document under a well-known key, atomically via a temp file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use directories::ProjectDirs;

use crate::error::Result;

use super::credential::Credential;

/// The one storage key the credential lives under.
pub const TOKEN_STORAGE_KEY: &str = "access_token";

/// Backend that survives process restarts.
pub trait TokenStorage: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
    fn remove(&self) -> Result<()>;
}

/// Stores the credential as `access_token.json` on disk.
#[derive(Debug, Clone)]
pub struct FileTokenStorage {
    path: PathBuf,
}

impl FileTokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Storage under the platform cache dir (~/.cache/crm-sync on Linux).
    pub fn default_location() -> Option<Self> {
        ProjectDirs::from("", "", "crm-sync")
            .map(|dirs| Self::new(dirs.cache_dir().join(format!("{TOKEN_STORAGE_KEY}.json"))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStorage for FileTokenStorage {
    fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path)?;
        let credential: Credential = serde_json::from_str(&contents)?;
        Ok(Some(credential))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(credential)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Process-local storage, used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    slot: Mutex<Option<Credential>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn load(&self) -> Result<Option<Credential>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(credential.clone());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::new(temp_dir.path().join("nested/access_token.json"));

        storage.save(&Credential::new("abc")).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, "abc");
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::new(temp_dir.path().join("access_token.json"));
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::new(temp_dir.path().join("access_token.json"));
        storage.save(&Credential::new("abc")).unwrap();

        storage.remove().unwrap();
        assert!(storage.load().unwrap().is_none());
        // Removing twice is fine.
        storage.remove().unwrap();
    }

    #[test]
    fn test_default_location_uses_storage_key() {
        if let Some(storage) = FileTokenStorage::default_location() {
            assert!(storage.path().ends_with("access_token.json"));
        }
    }
}
