// Invalidation scheduling.
// Maps a settled mutation to the key prefixes that must be refetched.

use std::fmt;
use std::sync::Arc;

use crate::cache::QueryKey;

use super::definition::MutationDefinition;

/// How a mutation attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// Which outcomes a rule fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum When {
    #[default]
    Settled,
    Success,
    Failure,
}

impl When {
    fn applies_to(&self, outcome: Outcome) -> bool {
        match self {
            When::Settled => true,
            When::Success => outcome == Outcome::Committed,
            When::Failure => outcome == Outcome::RolledBack,
        }
    }
}

type PrefixFn<V> = Arc<dyn Fn(&V) -> Vec<QueryKey> + Send + Sync>;

/// Key prefixes to refetch once a mutation settles.
pub struct InvalidationRule<V> {
    pub when: When,
    prefixes: PrefixFn<V>,
}

impl<V> InvalidationRule<V> {
    pub fn new(when: When, prefixes: impl Fn(&V) -> Vec<QueryKey> + Send + Sync + 'static) -> Self {
        Self {
            when,
            prefixes: Arc::new(prefixes),
        }
    }

    /// Prefixes that do not depend on the mutation input.
    pub fn fixed(when: When, prefixes: Vec<QueryKey>) -> Self {
        Self::new(when, move |_| prefixes.clone())
    }

    pub fn match_key_prefixes(&self, vars: &V) -> Vec<QueryKey> {
        (self.prefixes)(vars)
    }
}

impl<V> Clone for InvalidationRule<V> {
    fn clone(&self) -> Self {
        Self {
            when: self.when,
            prefixes: self.prefixes.clone(),
        }
    }
}

impl<V> fmt::Debug for InvalidationRule<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("when", &self.when)
            .finish_non_exhaustive()
    }
}

/// Stateless lookup from a settled mutation to the prefixes to invalidate.
pub struct InvalidationScheduler;

impl InvalidationScheduler {
    /// Collect the prefixes of every rule matching `outcome`. Duplicates and
    /// prefixes already covered by a broader one are dropped.
    pub fn prefixes<V>(definition: &MutationDefinition<V>, vars: &V, outcome: Outcome) -> Vec<QueryKey> {
        let mut candidates: Vec<QueryKey> = definition
            .invalidation_rules()
            .iter()
            .filter(|rule| rule.when.applies_to(outcome))
            .flat_map(|rule| rule.match_key_prefixes(vars))
            .collect();
        // Broader prefixes first so narrower ones are recognised as covered.
        candidates.sort_by_key(|key| key.parts().len());

        let mut selected: Vec<QueryKey> = Vec::new();
        for key in candidates {
            if !selected.iter().any(|broader| key.starts_with(broader)) {
                selected.push(key);
            }
        }
        selected
    }
}
