// Client-side data synchronization core for the sales CRM.
// Authenticated transport, a shared query cache and optimistic mutations behind one engine.

pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod crm;
pub mod engine;
pub mod error;
pub mod mutation;
pub mod transport;

pub use auth::{Credential, CredentialStore, TokenStorage};
pub use cache::{CacheEntry, Query, QueryCache, QueryKey, Scope, Subscription};
pub use config::SyncConfig;
pub use connectivity::Connectivity;
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use mutation::{MutationCoordinator, MutationDefinition, MutationReport, Speculation};
pub use transport::{Connector, Method, Transport};

/// Route `tracing` output to the test harness. Honors `RUST_LOG`.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
