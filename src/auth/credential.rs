// Process-wide access credential.
// The refresh secret never lives here; it rides in an HTTP-only cookie.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::storage::TokenStorage;

/// Short-lived bearer credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    /// Server's hint for when the token stops working. Advisory only;
    /// a 401 is what actually triggers a refresh.
    pub expiry_hint: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expiry_hint: None,
        }
    }

    pub fn with_expiry(mut self, expiry_hint: DateTime<Utc>) -> Self {
        self.expiry_hint = Some(expiry_hint);
        self
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expiry_hint", &self.expiry_hint)
            .finish()
    }
}

/// Holder for the current credential, mirrored to durable storage.
pub struct CredentialStore {
    current: Mutex<Option<Credential>>,
    storage: Arc<dyn TokenStorage>,
}

impl CredentialStore {
    /// Create a store and restore whatever credential was persisted.
    /// An unreadable persisted credential counts as logged out.
    pub fn load(storage: Arc<dyn TokenStorage>) -> Self {
        let current = match storage.load() {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable persisted credential");
                None
            }
        };
        Self {
            current: Mutex::new(current),
            storage,
        }
    }

    pub fn get(&self) -> Option<Credential> {
        self.lock().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock().is_some()
    }

    pub fn set(&self, credential: Credential) {
        if let Err(e) = self.storage.save(&credential) {
            tracing::warn!(error = %e, "Failed to persist access credential");
        }
        *self.lock() = Some(credential);
    }

    pub fn clear(&self) {
        if let Err(e) = self.storage.remove() {
            tracing::warn!(error = %e, "Failed to remove persisted credential");
        }
        self.lock().take();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Credential>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::{FileTokenStorage, MemoryTokenStorage};

    #[test]
    fn test_set_get_clear() {
        let storage = Arc::new(MemoryTokenStorage::new());
        let store = CredentialStore::load(storage.clone());
        assert!(store.get().is_none());

        store.set(Credential::new("t1"));
        assert_eq!(store.get().unwrap().access_token, "t1");
        assert_eq!(storage.load().unwrap().unwrap().access_token, "t1");

        store.clear();
        assert!(store.get().is_none());
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn test_restores_persisted_credential() {
        let storage = Arc::new(MemoryTokenStorage::with_credential(Credential::new("saved")));
        let store = CredentialStore::load(storage);
        assert_eq!(store.get().unwrap().access_token, "saved");
    }

    #[test]
    fn test_corrupt_file_counts_as_logged_out() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("access_token.json");
        std::fs::write(&path, "not json").unwrap();

        let store = CredentialStore::load(Arc::new(FileTokenStorage::new(&path)));
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", Credential::new("secret-token"));
        assert!(!rendered.contains("secret-token"));
    }
}
