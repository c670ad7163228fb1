// Optimistic mutation coordinator.
// Runs a mutation through speculate, execute, commit or rollback, then invalidation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::{CacheEntry, QueryCache, QueryKey};
use crate::connectivity::Connectivity;
use crate::error::{Result, SyncError};
use crate::transport::Transport;

use super::definition::MutationDefinition;
use super::invalidation::{InvalidationScheduler, Outcome};

/// Where a mutation attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Pending,
    Speculating,
    /// Waiting for connectivity before the server call.
    Queued,
    InFlight,
    Committed,
    RolledBack,
    /// Input failed validation; nothing was touched.
    Rejected,
}

/// Prior entry for every key a mutation speculatively wrote.
///
/// Restores the cache when dropped without being discarded, so an abandoned
/// mutation future never leaves speculative data behind.
pub struct MutationSnapshot {
    cache: QueryCache,
    entries: Vec<(QueryKey, Option<CacheEntry>)>,
    armed: bool,
}

impl MutationSnapshot {
    fn new(cache: QueryCache) -> Self {
        Self {
            cache,
            entries: Vec::new(),
            armed: true,
        }
    }

    /// Record the prior entry for `key` unless it was already captured.
    fn capture(&mut self, key: &QueryKey) {
        if self.entries.iter().any(|(captured, _)| captured == key) {
            return;
        }
        self.entries.push((key.clone(), self.cache.peek(key)));
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Put every captured key back exactly as it was, freshness included.
    pub fn restore(mut self) {
        self.restore_entries();
        self.armed = false;
    }

    pub fn discard(mut self) {
        self.armed = false;
    }

    fn restore_entries(&mut self) {
        for (key, prior) in self.entries.drain(..) {
            self.cache.restore(&key, prior);
        }
    }
}

impl Drop for MutationSnapshot {
    fn drop(&mut self) {
        if self.armed && !self.entries.is_empty() {
            tracing::warn!(keys = self.entries.len(), "Mutation abandoned, restoring snapshot");
            self.restore_entries();
        }
    }
}

/// Result of one mutation attempt.
#[derive(Debug, Clone)]
pub struct MutationReport {
    pub name: &'static str,
    /// Terminal phase: `Committed`, `RolledBack` or `Rejected`.
    pub phase: MutationPhase,
    pub result: Result<Value>,
    /// Keys that were speculatively written (and restored on rollback).
    pub speculated: Vec<QueryKey>,
    pub invalidated: Vec<QueryKey>,
    /// Whether the call had to wait for connectivity.
    pub queued: bool,
}

impl MutationReport {
    pub fn is_committed(&self) -> bool {
        self.phase == MutationPhase::Committed
    }

    pub fn into_result(self) -> Result<Value> {
        self.result
    }
}

/// Applies mutation definitions against the shared cache and transport.
///
/// Concurrent mutations touching the same keys are not serialized: their
/// speculative writes land in issuance order and the last invalidation wins.
#[derive(Clone)]
pub struct MutationCoordinator {
    cache: QueryCache,
    transport: Arc<Transport>,
    connectivity: Connectivity,
    /// FIFO gate that replays offline mutations in issuance order.
    replay: Arc<AsyncMutex<()>>,
    /// Mutations waiting at or holding the gate.
    backlog: Arc<AtomicUsize>,
}

/// Counts a mutation in the backlog until dropped.
struct BacklogTicket(Arc<AtomicUsize>);

impl BacklogTicket {
    fn take(backlog: &Arc<AtomicUsize>) -> Self {
        backlog.fetch_add(1, Ordering::SeqCst);
        Self(backlog.clone())
    }
}

impl Drop for BacklogTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MutationCoordinator {
    /// Connectivity is shared with the transport, which reports outages and recovery.
    pub fn new(cache: QueryCache, transport: Arc<Transport>) -> Self {
        let connectivity = transport.connectivity().clone();
        Self {
            cache,
            transport,
            connectivity,
            replay: Arc::new(AsyncMutex::new(())),
            backlog: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run a mutation and return its value or error.
    pub async fn mutate<V>(&self, definition: &MutationDefinition<V>, vars: V) -> Result<Value>
    where
        V: Clone + Send + 'static,
    {
        self.run(definition, vars).await.into_result()
    }

    /// Run a mutation and report every step it took.
    pub async fn run<V>(&self, definition: &MutationDefinition<V>, vars: V) -> MutationReport
    where
        V: Clone + Send + 'static,
    {
        let name = definition.name();
        let mut phase = MutationPhase::Pending;
        tracing::debug!(mutation = name, ?phase, "Mutation issued");

        if let Err(reason) = definition.check(&vars) {
            tracing::debug!(mutation = name, %reason, "Mutation rejected");
            return MutationReport {
                name,
                phase: MutationPhase::Rejected,
                result: Err(SyncError::ValidationFailed(reason)),
                speculated: Vec::new(),
                invalidated: Vec::new(),
                queued: false,
            };
        }

        phase = MutationPhase::Speculating;
        let snapshot = self.speculate(definition, &vars);
        let speculated: Vec<QueryKey> = snapshot.keys().cloned().collect();
        tracing::debug!(mutation = name, ?phase, keys = speculated.len(), "Applied speculative writes");

        phase = MutationPhase::InFlight;
        tracing::debug!(mutation = name, ?phase, "Calling server");
        let (result, queued) = self.execute(definition, vars.clone()).await;

        let outcome = match &result {
            Ok(response) => {
                snapshot.discard();
                for (key, value) in definition.reconciliation(&vars, response) {
                    self.cache.write(&key, value);
                }
                phase = MutationPhase::Committed;
                Outcome::Committed
            }
            Err(e) => {
                snapshot.restore();
                phase = MutationPhase::RolledBack;
                tracing::warn!(mutation = name, error = %e, "Mutation failed, rolled back");
                Outcome::RolledBack
            }
        };

        let invalidated = InvalidationScheduler::prefixes(definition, &vars, outcome);
        for prefix in &invalidated {
            self.cache.invalidate(prefix);
        }
        tracing::debug!(mutation = name, ?phase, invalidated = invalidated.len(), "Mutation settled");

        MutationReport {
            name,
            phase,
            result,
            speculated,
            invalidated,
            queued,
        }
    }

    /// Cancel loads, snapshot, then write each speculative value.
    /// The cancel must come first or a late load could overwrite the speculation.
    fn speculate<V>(&self, definition: &MutationDefinition<V>, vars: &V) -> MutationSnapshot {
        let speculations = definition.speculations(vars);
        let mut snapshot = MutationSnapshot::new(self.cache.clone());

        for speculation in &speculations {
            self.cache.cancel_in_flight(&speculation.key);
            snapshot.capture(&speculation.key);
        }
        for speculation in speculations {
            let key = speculation.key.clone();
            let current = self.cache.data(&key);
            if let Some(next) = speculation.apply(current.as_ref()) {
                self.cache.write(&key, next);
            }
        }
        snapshot
    }

    /// Call the server, waiting out offline periods. Queued calls are replayed
    /// one at a time in the order they queued, and a call issued while the
    /// backlog drains joins the back of it.
    async fn execute<V>(&self, definition: &MutationDefinition<V>, vars: V) -> (Result<Value>, bool)
    where
        V: Clone + Send + 'static,
    {
        let mut queued = false;
        loop {
            let gate = if self.connectivity.is_online() && self.backlog.load(Ordering::SeqCst) == 0 {
                None
            } else {
                queued = true;
                tracing::info!(
                    mutation = definition.name(),
                    phase = ?MutationPhase::Queued,
                    online = self.connectivity.is_online(),
                    "Queueing mutation"
                );
                let ticket = BacklogTicket::take(&self.backlog);
                let permit = self.replay.clone().lock_owned().await;
                self.transport.reconnect().await;
                Some((permit, ticket))
            };

            let result = definition
                .execute(self.transport.clone(), vars.clone())
                .await;
            drop(gate);

            match result {
                // The transport has already flagged connectivity as lost.
                Err(SyncError::NetworkUnavailable) => {
                    self.connectivity.set_online(false);
                    continue;
                }
                other => return (other, queued),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::cache::keys::{CONTACTS, OPPORTUNITIES, dashboard};
    use crate::cache::{EntryPolicy, Query, loader};
    use crate::mutation::definition::Speculation;
    use crate::transport::Method;
    use crate::transport::client::tests::{FakeServer, transport_on};

    fn coordinator(connectivity: Connectivity) -> (MutationCoordinator, QueryCache) {
        let cache = QueryCache::new(EntryPolicy::default(), connectivity.clone());
        let transport = transport_on(FakeServer::new("t"), Some("t"), connectivity);
        (MutationCoordinator::new(cache.clone(), transport), cache)
    }

    /// Renames a contact; the server outcome is scripted per call.
    fn rename(outcome: Result<Value>) -> MutationDefinition<(String, String)> {
        MutationDefinition::new("contacts.rename", move |_t, _v: (String, String)| {
            let outcome = outcome.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                outcome
            }
        })
        .speculate(|(id, name)| {
            let name = name.clone();
            vec![Speculation::new(CONTACTS.detail(id), move |prior| {
                let mut next = prior?.clone();
                next["name"] = json!(name);
                Some(next)
            })]
        })
        .invalidate(|(id, _)| vec![CONTACTS.detail(id), dashboard::all()])
    }

    fn vars(id: &str, name: &str) -> (String, String) {
        (id.to_string(), name.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_keeps_speculation_and_invalidates() {
        let (coordinator, cache) = coordinator(Connectivity::default());
        let key = CONTACTS.detail("1");
        cache.write(&key, json!({"id": "1", "name": "Ada"}));

        let report = coordinator.run(&rename(Ok(json!({}))), vars("1", "Grace")).await;

        assert_eq!(report.phase, MutationPhase::Committed);
        assert_eq!(report.speculated, vec![key.clone()]);
        assert_eq!(report.invalidated, vec![dashboard::all(), key.clone()]);
        let entry = cache.peek(&key).unwrap();
        assert_eq!(entry.data, Some(json!({"id": "1", "name": "Grace"})));
        assert!(entry.invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_restores_prior_data_verbatim() {
        let (coordinator, cache) = coordinator(Connectivity::default());
        let key = CONTACTS.detail("1");
        let before = json!({"id": "1", "name": "Ada", "tags": ["vip"], "score": 1.5});
        cache.write(&key, before.clone());

        let def = rename(Err(SyncError::RequestFailed("conflict".into())));
        let report = coordinator.run(&def, vars("1", "Grace")).await;

        assert_eq!(report.phase, MutationPhase::RolledBack);
        assert_eq!(report.result.unwrap_err(), SyncError::RequestFailed("conflict".into()));
        assert_eq!(cache.data(&key), Some(before));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_keeps_prior_staleness() {
        let (coordinator, cache) = coordinator(Connectivity::default());
        let key = CONTACTS.detail("1");
        cache.write(&key, json!({"id": "1", "name": "Ada"}));
        cache.invalidate(&key);
        let before = cache.peek(&key).unwrap();

        // No invalidation rules, so only the restore decides freshness.
        let def = MutationDefinition::new("contacts.rename", |_t, _v: (String, String)| async {
            Err(SyncError::RequestFailed("conflict".into()))
        })
        .speculate(|(id, name)| {
            vec![Speculation::replace(CONTACTS.detail(id), json!({"id": id, "name": name}))]
        });
        let report = coordinator.run(&def, vars("1", "Grace")).await;

        assert_eq!(report.phase, MutationPhase::RolledBack);
        assert!(report.invalidated.is_empty());
        let after = cache.peek(&key).unwrap();
        assert_eq!(after.data, before.data);
        assert_eq!(after.fetched_at, before.fetched_at);
        assert!(after.invalidated);
        assert!(after.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_of_uncached_key_leaves_a_miss() {
        let (coordinator, cache) = coordinator(Connectivity::default());
        let key = CONTACTS.detail("new");
        let def = MutationDefinition::new("contacts.create", |_t, _v: ()| async {
            Err(SyncError::RequestFailed("duplicate".into()))
        })
        .speculate(|_| vec![Speculation::replace(CONTACTS.detail("new"), json!({"id": "new"}))]);

        coordinator.run(&def, ()).await;
        assert!(cache.data(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_touches_nothing() {
        let (coordinator, cache) = coordinator(Connectivity::default());
        let key = CONTACTS.detail("1");
        cache.write(&key, json!({"id": "1", "name": "Ada"}));
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let def = MutationDefinition::new("contacts.rename", move |_t, _v: (String, String)| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok(Value::Null) }
        })
        .validate(|(_, name)| {
            if name.trim().is_empty() {
                Err("name must not be blank".into())
            } else {
                Ok(())
            }
        })
        .speculate(|(id, _)| vec![Speculation::replace(CONTACTS.detail(id), Value::Null)]);

        let report = coordinator.run(&def, vars("1", "  ")).await;
        assert_eq!(report.phase, MutationPhase::Rejected);
        assert!(matches!(report.result, Err(SyncError::ValidationFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.data(&key), Some(json!({"id": "1", "name": "Ada"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_load_cannot_clobber_speculation() {
        let (coordinator, cache) = coordinator(Connectivity::default());
        let key = CONTACTS.detail("1");
        cache.write(&key, json!({"id": "1", "name": "Ada"}));
        cache.invalidate(&key);

        // A slow load of the pre-mutation server state.
        let slow = Query::new(
            key.clone(),
            loader(|_| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(json!({"id": "1", "name": "Ada"}))
            }),
        );
        cache.read(&slow);
        assert!(cache.peek(&key).unwrap().is_fetching());

        // Server call outlasts the load.
        coordinator.run(&rename(Ok(json!({}))), vars("1", "Grace")).await;
        assert_eq!(cache.data(&key), Some(json!({"id": "1", "name": "Grace"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_writes_server_response() {
        let (coordinator, cache) = coordinator(Connectivity::default());
        let key = CONTACTS.detail("1");
        cache.write(&key, json!({"id": "1", "name": "Ada"}));
        let def = rename(Ok(json!({"id": "1", "name": "Grace", "version": 2})))
            .reconcile(|(id, _), response| vec![(CONTACTS.detail(id), response.clone())]);

        coordinator.run(&def, vars("1", "Grace")).await;
        assert_eq!(
            cache.data(&key),
            Some(json!({"id": "1", "name": "Grace", "version": 2}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_mutation_restores_snapshot() {
        let (coordinator, cache) = coordinator(Connectivity::default());
        let key = CONTACTS.detail("1");
        cache.write(&key, json!({"id": "1", "name": "Ada"}));

        let def = rename(Ok(json!({})));
        let run = coordinator.run(&def, vars("1", "Grace"));
        let timed_out = tokio::time::timeout(Duration::from_millis(5), run).await;
        assert!(timed_out.is_err());

        assert_eq!(cache.data(&key), Some(json!({"id": "1", "name": "Ada"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_mutations_replay_in_issuance_order() {
        let connectivity = Connectivity::new(false);
        let (coordinator, cache) = coordinator(connectivity.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let def = Arc::new(
            MutationDefinition::new("opportunities.touch", move |_t, n: u32| {
                let seen = seen.clone();
                async move {
                    // Later mutations answer faster, so only the gate keeps order.
                    tokio::time::sleep(Duration::from_millis(u64::from(10 - n))).await;
                    seen.lock().unwrap().push(n);
                    Ok(json!(n))
                }
            })
            .speculate(|n| vec![Speculation::replace(OPPORTUNITIES.detail("1"), json!(n))]),
        );

        let mut handles = Vec::new();
        for n in 0..3u32 {
            let coordinator = coordinator.clone();
            let def = def.clone();
            handles.push(tokio::spawn(async move { coordinator.run(&def, n).await }));
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(order.lock().unwrap().is_empty());
        // Speculation is visible while queued.
        assert_eq!(cache.data(&OPPORTUNITIES.detail("1")), Some(json!(2)));

        connectivity.set_online(true);
        for handle in handles {
            let report = handle.await.unwrap();
            assert!(report.queued);
            assert!(report.is_committed());
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_issued_during_replay_waits_its_turn() {
        let connectivity = Connectivity::new(false);
        let (coordinator, _cache) = coordinator(connectivity.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let def = Arc::new(MutationDefinition::new("opportunities.touch", move |_t, n: u32| {
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(u64::from(10 - n))).await;
                seen.lock().unwrap().push(n);
                Ok(json!(n))
            }
        }));
        let spawn = |n: u32| {
            let coordinator = coordinator.clone();
            let def = def.clone();
            tokio::spawn(async move { coordinator.run(&def, n).await })
        };

        let mut handles = Vec::new();
        for n in 0..3u32 {
            handles.push(spawn(n));
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        connectivity.set_online(true);
        handles.push(spawn(3));
        for handle in handles {
            assert!(handle.await.unwrap().is_committed());
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_mutation_resumes_when_server_recovers() {
        let server = FakeServer::new("t");
        let connectivity = Connectivity::default();
        let cache = QueryCache::new(EntryPolicy::default(), connectivity.clone());
        let transport = transport_on(server.clone(), Some("t"), connectivity.clone());
        let coordinator = MutationCoordinator::new(cache, transport);
        let def = MutationDefinition::new("opportunities.close", |t: Arc<Transport>, id: String| async move {
            t.send_json(
                &format!("/opportunities/{id}"),
                Method::PATCH,
                json!({"stage": "closed_won"}),
            )
            .await
        });

        server.offline.store(true, Ordering::SeqCst);
        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(&def, "42".to_string()).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!run.is_finished());
        assert!(!connectivity.is_online());

        // Nobody reports the recovery; the coordinator has to notice it.
        server.offline.store(false, Ordering::SeqCst);
        let report = tokio::time::timeout(Duration::from_secs(60), run)
            .await
            .unwrap()
            .unwrap();
        assert!(report.is_committed());
        assert!(report.queued);
        assert!(connectivity.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_requeues_until_online() {
        let connectivity = Connectivity::default();
        let (coordinator, _cache) = coordinator(connectivity.clone());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = attempts.clone();
        let def = MutationDefinition::new("meetings.cancel", move |_t, _v: ()| {
            let attempt = counted.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(SyncError::NetworkUnavailable)
                } else {
                    Ok(json!("cancelled"))
                }
            }
        });

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(&def, ()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!connectivity.is_online());

        connectivity.set_online(true);
        let report = run.await.unwrap();
        assert_eq!(report.result.unwrap(), json!("cancelled"));
        assert!(report.queued);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
