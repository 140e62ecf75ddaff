//! Dynamic symbol resolution.
//!
//! Declaration files refer to implementations by string identifier
//! (`"module:qualname"`); the engine resolves an identifier to an actual
//! function the first time the binding is about to run. The [`SymbolResolver`]
//! trait is the seam: production libraries hand the engine a [`SymbolTable`]
//! their backends fill at load time, tests substitute their own tables.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::context::DispatchContext;
use crate::error::{ImplError, ResolveError};
use crate::value::{CallArgs, Value};

/// A backend implementation of one dispatchable function.
pub type ImplFn = Arc<dyn Fn(&DispatchContext, &CallArgs) -> Result<Value, ImplError> + Send + Sync>;

/// Answer of a `should_run` predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldRun {
    /// Run this backend's implementation.
    Accept,
    /// Let the engine try the next candidate.
    Defer,
}

/// A backend's `should_run` predicate.
pub type ShouldRunFn = Arc<dyn Fn(&DispatchContext, &CallArgs) -> ShouldRun + Send + Sync>;

/// Resolves string identifiers to callable symbols.
pub trait SymbolResolver: Send + Sync {
    fn resolve_function(&self, ident: &str) -> Result<ImplFn, ResolveError>;

    fn resolve_should_run(&self, ident: &str) -> Result<ShouldRunFn, ResolveError>;
}

/// The shipped resolver: a plain registry of symbols keyed by identifier.
///
/// Backend packages register their implementations here during their own
/// initialization; nothing is resolved until the engine first needs a
/// binding, so registering is cheap and order-independent.
#[derive(Default)]
pub struct SymbolTable {
    functions: RwLock<HashMap<String, ImplFn>>,
    predicates: RwLock<HashMap<String, ShouldRunFn>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(
        &self,
        ident: impl Into<String>,
        f: impl Fn(&DispatchContext, &CallArgs) -> Result<Value, ImplError> + Send + Sync + 'static,
    ) {
        self.functions.write().expect("symbol table poisoned").insert(ident.into(), Arc::new(f));
    }

    pub fn register_should_run(
        &self,
        ident: impl Into<String>,
        f: impl Fn(&DispatchContext, &CallArgs) -> ShouldRun + Send + Sync + 'static,
    ) {
        self.predicates.write().expect("symbol table poisoned").insert(ident.into(), Arc::new(f));
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve_function(&self, ident: &str) -> Result<ImplFn, ResolveError> {
        self.functions
            .read()
            .expect("symbol table poisoned")
            .get(ident)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(ident.to_string()))
    }

    fn resolve_should_run(&self, ident: &str) -> Result<ShouldRunFn, ResolveError> {
        self.predicates
            .read()
            .expect("symbol table poisoned")
            .get(ident)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(ident.to_string()))
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let functions = self.functions.read().expect("symbol table poisoned");
        let predicates = self.predicates.read().expect("symbol table poisoned");
        f.debug_struct("SymbolTable")
            .field("functions", &functions.keys().collect::<Vec<_>>())
            .field("predicates", &predicates.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value;

    #[test]
    fn resolve_registered_function() {
        let table = SymbolTable::new();
        table.register_function("m:f", |_ctx, _args| Ok(value(1i64)));

        assert!(table.resolve_function("m:f").is_ok());
        assert!(matches!(
            table.resolve_function("m:missing"),
            Err(ResolveError::NotFound(_))
        ));
    }

    #[test]
    fn resolve_should_run_is_separate_namespace() {
        let table = SymbolTable::new();
        table.register_should_run("m:f", |_ctx, _args| ShouldRun::Defer);

        assert!(table.resolve_should_run("m:f").is_ok());
        assert!(table.resolve_function("m:f").is_err());
    }
}
