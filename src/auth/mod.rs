// Credential handling.
// Holds the short-lived access credential and persists it across reloads.

pub mod credential;
pub mod storage;

pub use credential::{Credential, CredentialStore};
pub use storage::{FileTokenStorage, MemoryTokenStorage, TOKEN_STORAGE_KEY, TokenStorage};
