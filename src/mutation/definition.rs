// Declarative mutation definitions.
// A definition bundles the server call, speculative cache updates and invalidation rules.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::cache::QueryKey;
use crate::error::Result;
use crate::transport::Transport;

use super::invalidation::{InvalidationRule, When};

type ExecuteFn<V> = Arc<dyn Fn(Arc<Transport>, V) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type ValidateFn<V> = Arc<dyn Fn(&V) -> std::result::Result<(), String> + Send + Sync>;
type SpeculateFn<V> = Arc<dyn Fn(&V) -> Vec<Speculation> + Send + Sync>;
type ReconcileFn<V> = Arc<dyn Fn(&V, &Value) -> Vec<(QueryKey, Value)> + Send + Sync>;

/// Computes the speculative value for one key from its current data.
/// Returning `None` leaves the key untouched.
pub type Updater = Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>;

/// A speculative write to one cache key.
pub struct Speculation {
    pub key: QueryKey,
    updater: Updater,
}

impl Speculation {
    pub fn new(
        key: QueryKey,
        updater: impl FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
    ) -> Self {
        Self {
            key,
            updater: Box::new(updater),
        }
    }

    /// Replace the entry outright, cached or not.
    pub fn replace(key: QueryKey, value: Value) -> Self {
        Self::new(key, move |_| Some(value))
    }

    pub fn apply(self, prior: Option<&Value>) -> Option<Value> {
        (self.updater)(prior)
    }
}

impl fmt::Debug for Speculation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Speculation").field("key", &self.key).finish()
    }
}

/// A write operation with a concrete input type `V`.
///
/// ```ignore
/// let def = MutationDefinition::new("contacts.rename", |transport, v: Rename| async move {
///         transport.send_json(&format!("/contacts/{}", v.id), Method::PATCH, json!({"name": v.name})).await
///     })
///     .speculate(|v| vec![Speculation::replace(CONTACTS.detail(&v.id), json!({"id": v.id, "name": v.name}))])
///     .invalidate(|v| vec![CONTACTS.detail(&v.id), CONTACTS.lists()]);
/// ```
pub struct MutationDefinition<V> {
    name: &'static str,
    execute: ExecuteFn<V>,
    validate: Option<ValidateFn<V>>,
    speculators: Vec<SpeculateFn<V>>,
    reconcile: Option<ReconcileFn<V>>,
    rules: Vec<InvalidationRule<V>>,
}

impl<V> MutationDefinition<V> {
    pub fn new<F, Fut>(name: &'static str, execute: F) -> Self
    where
        F: Fn(Arc<Transport>, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name,
            execute: Arc::new(move |transport, vars| execute(transport, vars).boxed()),
            validate: None,
            speculators: Vec::new(),
            reconcile: None,
            rules: Vec::new(),
        }
    }

    /// Reject input before anything is touched.
    pub fn validate(
        mut self,
        validate: impl Fn(&V) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Add speculative cache updates applied before the server call.
    pub fn speculate(
        mut self,
        speculate: impl Fn(&V) -> Vec<Speculation> + Send + Sync + 'static,
    ) -> Self {
        self.speculators.push(Arc::new(speculate));
        self
    }

    /// Write the server's response into the cache on success.
    pub fn reconcile(
        mut self,
        reconcile: impl Fn(&V, &Value) -> Vec<(QueryKey, Value)> + Send + Sync + 'static,
    ) -> Self {
        self.reconcile = Some(Arc::new(reconcile));
        self
    }

    /// Invalidate these prefixes whenever the mutation settles.
    pub fn invalidate(self, prefixes: impl Fn(&V) -> Vec<QueryKey> + Send + Sync + 'static) -> Self {
        self.invalidate_on(When::Settled, prefixes)
    }

    pub fn invalidate_on(
        mut self,
        when: When,
        prefixes: impl Fn(&V) -> Vec<QueryKey> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(InvalidationRule::new(when, prefixes));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn invalidation_rules(&self) -> &[InvalidationRule<V>] {
        &self.rules
    }

    pub(crate) fn check(&self, vars: &V) -> std::result::Result<(), String> {
        match &self.validate {
            Some(validate) => validate(vars),
            None => Ok(()),
        }
    }

    pub(crate) fn speculations(&self, vars: &V) -> Vec<Speculation> {
        self.speculators
            .iter()
            .flat_map(|speculate| speculate(vars))
            .collect()
    }

    pub(crate) fn execute(&self, transport: Arc<Transport>, vars: V) -> BoxFuture<'static, Result<Value>> {
        (self.execute)(transport, vars)
    }

    pub(crate) fn reconciliation(&self, vars: &V, response: &Value) -> Vec<(QueryKey, Value)> {
        match &self.reconcile {
            Some(reconcile) => reconcile(vars, response),
            None => Vec::new(),
        }
    }
}

impl<V> fmt::Debug for MutationDefinition<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDefinition")
            .field("name", &self.name)
            .field("speculators", &self.speculators.len())
            .field("rules", &self.rules)
            .finish()
    }
}
