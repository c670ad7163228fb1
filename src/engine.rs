// Sync engine.
// Wires credentials, transport, cache and mutation coordinator into one handle with an explicit lifecycle.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::auth::{Credential, CredentialStore, FileTokenStorage, MemoryTokenStorage, TokenStorage};
use crate::cache::{CacheEntry, EntryPolicy, Query, QueryCache, QueryKey, Subscription, loader};
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::mutation::{MutationCoordinator, MutationDefinition, MutationReport};
use crate::transport::{Connector, Method, Payload, RequestBody, RequestOptions, ReqwestConnector, Transport};

/// One isolated instance of the sync core. Applications normally hold a
/// single engine for the process; tests build one per case.
pub struct SyncEngine {
    config: SyncConfig,
    connectivity: Connectivity,
    credentials: Arc<CredentialStore>,
    transport: Arc<Transport>,
    cache: QueryCache,
    coordinator: MutationCoordinator,
}

impl SyncEngine {
    /// Build an engine that talks HTTP through `reqwest` and persists the
    /// access token on disk.
    pub fn init(config: SyncConfig) -> Result<Self> {
        let connector = Arc::new(ReqwestConnector::new(config.request_timeout())?);
        let storage: Arc<dyn TokenStorage> = match config
            .token_path
            .clone()
            .map(FileTokenStorage::new)
            .or_else(FileTokenStorage::default_location)
        {
            Some(storage) => Arc::new(storage),
            None => {
                tracing::warn!("No cache directory available, credential will not persist");
                Arc::new(MemoryTokenStorage::new())
            }
        };
        Self::with_parts(config, connector, storage)
    }

    pub fn with_parts(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        storage: Arc<dyn TokenStorage>,
    ) -> Result<Self> {
        config.validate()?;

        let connectivity = Connectivity::default();
        let credentials = Arc::new(CredentialStore::load(storage));
        let transport = Arc::new(Transport::new(
            &config,
            connector,
            credentials.clone(),
            connectivity.clone(),
        ));
        let cache = QueryCache::new(
            EntryPolicy {
                stale_after: config.stale_after(),
                evict_after: config.evict_after(),
            },
            connectivity.clone(),
        );
        let coordinator = MutationCoordinator::new(cache.clone(), transport.clone());

        tracing::info!(
            base_url = config.base_url(),
            authenticated = credentials.is_authenticated(),
            "Sync engine initialized"
        );

        Ok(Self {
            config,
            connectivity,
            credentials,
            transport,
            cache,
            coordinator,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated()
    }

    /// Store the credential returned by a successful login.
    pub fn login(&self, credential: Credential) {
        self.credentials.set(credential);
    }

    /// Forget the credential and every cached result.
    pub fn logout(&self) {
        self.credentials.clear();
        self.cache.clear();
        tracing::info!("Logged out");
    }

    /// Report a connectivity change from the host platform.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Bind `key` to a GET of `endpoint`.
    pub fn query(&self, key: QueryKey, endpoint: impl Into<String>) -> Query {
        self.query_with(key, endpoint, RequestOptions::new())
    }

    pub fn query_with(
        &self,
        key: QueryKey,
        endpoint: impl Into<String>,
        options: RequestOptions,
    ) -> Query {
        let transport = self.transport.clone();
        let endpoint = endpoint.into();
        Query::new(
            key,
            loader(move |_key| {
                let transport = transport.clone();
                let endpoint = endpoint.clone();
                let options = options.clone();
                async move {
                    transport
                        .send(&endpoint, Method::GET, RequestBody::Empty, options)
                        .await
                        .map(Payload::into_value)
                }
            }),
        )
    }

    pub fn read(&self, query: &Query) -> Option<CacheEntry> {
        self.cache.read(query)
    }

    pub async fn fetch(&self, query: &Query) -> Result<Value> {
        self.cache.fetch(query).await
    }

    pub fn subscribe(&self, query: &Query) -> Subscription {
        self.cache.subscribe(query)
    }

    pub async fn mutate<V>(&self, definition: &MutationDefinition<V>, vars: V) -> Result<Value>
    where
        V: Clone + Send + 'static,
    {
        self.coordinator.mutate(definition, vars).await
    }

    pub async fn run<V>(&self, definition: &MutationDefinition<V>, vars: V) -> MutationReport
    where
        V: Clone + Send + 'static,
    {
        self.coordinator.run(definition, vars).await
    }

    /// Periodically evict unobserved entries. Abort the handle to stop.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let period = self.config.gc_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.collect_garbage();
            }
        })
    }

    /// Watch for outages. While offline the server is probed with backoff, and
    /// once it answers the stale observed entries are refetched. Abort the
    /// handle to stop.
    pub fn spawn_reconnect(&self) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let cache = self.cache.clone();
        let connectivity = self.connectivity.clone();
        tokio::spawn(async move {
            loop {
                connectivity.wait_offline().await;
                transport.reconnect().await;
                cache.revalidate_observed();
            }
        })
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("base_url", &self.config.base_url())
            .field("credentials", &self.credentials)
            .field("cache", &self.cache)
            .finish()
    }
}
