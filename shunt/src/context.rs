//! The context value threaded through `should_run` predicates and
//! context-aware implementations.

use std::sync::Arc;

use crate::ident::TypeKey;
use crate::state::EffectivePrefs;

/// Per-candidate call information handed to a backend.
///
/// Kept deliberately light: backends with more than one primary type use
/// [`types`](Self::types) to pick a return type; `should_run` policies often
/// only look at [`prioritized`](Self::prioritized).
#[derive(Debug, Clone)]
pub struct DispatchContext {
    types: Vec<TypeKey>,
    forced_type: Option<TypeKey>,
    backend: Arc<str>,
    prefs: Arc<EffectivePrefs>,
}

impl DispatchContext {
    pub(crate) fn new(
        types: Vec<TypeKey>,
        forced_type: Option<TypeKey>,
        backend: Arc<str>,
        prefs: Arc<EffectivePrefs>,
    ) -> Self {
        DispatchContext { types, forced_type, backend, prefs }
    }

    /// Unique keys of the dispatched argument types, sorted. Does not
    /// include the forced type.
    pub fn types(&self) -> &[TypeKey] {
        &self.types
    }

    /// The user's forced type for this call, if any.
    pub fn forced_type(&self) -> Option<&TypeKey> {
        self.forced_type.as_ref()
    }

    /// Name of the backend currently being tried.
    pub fn backend_name(&self) -> &str {
        &self.backend
    }

    /// Whether this backend was explicitly prioritized by the caller.
    pub fn prioritized(&self) -> bool {
        self.prefs.is_prioritized(&self.backend)
    }

    /// Read-only view of the effective preference state.
    pub fn prefs(&self) -> &EffectivePrefs {
        &self.prefs
    }
}
