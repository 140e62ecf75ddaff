//! The dispatch cache: memoized candidate plans keyed by function, type
//! multiset, and preference fingerprint.
//!
//! Plans are pure data; executing one never mutates the cache. Insertion is
//! racy-tolerant: two threads that compute the same plan both insert, the
//! last write wins, and the plans are equivalent because a plan is a
//! deterministic function of its key and the registry. The only
//! invalidation is a bulk clear on registry mutation; scope changes need no
//! invalidation because the fingerprint participates in the key.

use std::sync::Arc;

use dashmap::DashMap;

use crate::ident::TypeKey;
use crate::registry::{Backend, FunctionBinding};
use crate::state::Fingerprint;

/// Key of one memoized plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub function: Arc<str>,
    /// Sorted unique type keys of the dispatched arguments.
    pub types: Vec<TypeKey>,
    pub fingerprint: Fingerprint,
}

/// An ordered, filtered list of candidates the engine will try.
#[derive(Debug, Default)]
pub struct Plan {
    candidates: Vec<(Arc<Backend>, Arc<FunctionBinding>)>,
}

impl Plan {
    pub(crate) fn new(candidates: Vec<(Arc<Backend>, Arc<FunctionBinding>)>) -> Self {
        Plan { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidate backend names in the order they would be tried.
    pub fn backend_names(&self) -> Vec<String> {
        self.candidates.iter().map(|(b, _)| b.name().to_string()).collect()
    }

    pub(crate) fn iter(
        &self,
    ) -> impl Iterator<Item = &(Arc<Backend>, Arc<FunctionBinding>)> {
        self.candidates.iter()
    }
}

/// Concurrent map from [`PlanKey`] to resolved plan.
#[derive(Debug, Default)]
pub struct DispatchCache {
    plans: DashMap<PlanKey, Arc<Plan>>,
}

impl DispatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PlanKey) -> Option<Arc<Plan>> {
        self.plans.get(key).map(|p| Arc::clone(&p))
    }

    pub fn insert(&self, key: PlanKey, plan: Arc<Plan>) {
        self.plans.insert(key, plan);
    }

    /// Bulk invalidation, called on registry mutation.
    pub fn clear(&self) {
        self.plans.clear();
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
