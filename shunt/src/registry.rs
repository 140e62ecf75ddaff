//! The backend registry: parsed backend metadata plus the resolved base
//! priority order.
//!
//! The registry is built once during library initialization and is read-only
//! on the dispatch hot path. Per-backend configuration problems are
//! isolated: the offending backend is recorded as broken with a diagnostic
//! and the rest of the registry builds normally. Post-build mutation goes
//! through the privileged [`Registrar`](crate::engine::Registrar) and clears
//! the dispatch cache.

mod priority;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::decl::BackendDecl;
use crate::error::{ConfigError, DispatchError, RegistryError};
use crate::ident::{AbstractTable, MatchMode, TypeKey, TypeSpec};
use crate::resolve::{ImplFn, ShouldRunFn, SymbolResolver};

/// Name of the pseudo-backend carrying the library's own implementations.
pub const DEFAULT_BACKEND: &str = "default";

/// Parsed, immutable metadata of one backend.
#[derive(Debug)]
pub struct Backend {
    name: Arc<str>,
    primary: Vec<TypeSpec>,
    secondary: Vec<TypeSpec>,
    requires_opt_in: bool,
    higher_priority_than: Vec<String>,
    lower_priority_than: Vec<String>,
    functions: HashMap<String, Arc<FunctionBinding>>,
}

impl Backend {
    /// Builds a backend from a validated declaration.
    ///
    /// Abstract type specs must name bases registered in `abstracts`; this
    /// is the Rust analog of importing the abstract type at build time.
    pub(crate) fn from_decl(
        decl: &BackendDecl,
        abstracts: &AbstractTable,
    ) -> Result<Backend, ConfigError> {
        decl.validate(None)?;
        let name: Arc<str> = Arc::from(decl.name.as_str());

        let primary = decl.primary_specs()?;
        let secondary = decl.secondary_specs()?;
        for spec in primary.iter().chain(&secondary) {
            if spec.mode() == MatchMode::Abstract && !abstracts.contains(spec.key()) {
                return Err(ConfigError::UnknownAbstract { key: spec.key().clone() });
            }
        }

        let mut functions = HashMap::new();
        for (id, resolved) in decl.resolved_functions()? {
            functions.insert(
                id,
                Arc::new(FunctionBinding {
                    backend: Arc::clone(&name),
                    source: ImplSource::Symbol(resolved.function),
                    should_run_ref: resolved.should_run,
                    uses_context: resolved.uses_context,
                    additional_docs: resolved.additional_docs,
                    implementation: OnceLock::new(),
                    predicate: OnceLock::new(),
                }),
            );
        }

        Ok(Backend {
            name,
            primary,
            secondary,
            requires_opt_in: decl.effective_opt_in(),
            higher_priority_than: decl.higher_priority_than.clone(),
            lower_priority_than: decl.lower_priority_than.clone(),
            functions,
        })
    }

    fn default_backend() -> Backend {
        Backend {
            name: Arc::from(DEFAULT_BACKEND),
            primary: Vec::new(),
            secondary: Vec::new(),
            requires_opt_in: false,
            higher_priority_than: Vec::new(),
            lower_priority_than: Vec::new(),
            functions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub fn is_default(&self) -> bool {
        &*self.name == DEFAULT_BACKEND
    }

    pub fn requires_opt_in(&self) -> bool {
        self.requires_opt_in
    }

    pub(crate) fn primary_specs(&self) -> &[TypeSpec] {
        &self.primary
    }

    pub(crate) fn higher_priority_than(&self) -> &[String] {
        &self.higher_priority_than
    }

    pub(crate) fn lower_priority_than(&self) -> &[String] {
        &self.lower_priority_than
    }

    /// Whether this backend accepts a call: every dispatched type chain must
    /// be matched by some primary or secondary spec, and at least one chain
    /// must be matched by a *primary* spec. Secondary types are conversions
    /// a backend tolerates, not a reason to select it.
    pub(crate) fn matches(&self, chains: &[Vec<TypeKey>], abstracts: &AbstractTable) -> bool {
        let mut primary_hit = false;
        for chain in chains {
            if self.primary.iter().any(|spec| spec.matches(chain, abstracts)) {
                primary_hit = true;
            } else if !self.secondary.iter().any(|spec| spec.matches(chain, abstracts)) {
                return false;
            }
        }
        primary_hit
    }

    /// Whether a forced type is one of this backend's primary specs, which
    /// lets an opt-in backend participate without being prioritized.
    pub(crate) fn primary_accepts(&self, key: &TypeKey, abstracts: &AbstractTable) -> bool {
        let chain = [key.clone()];
        self.primary.iter().any(|spec| spec.matches(&chain, abstracts))
    }

    pub(crate) fn binding(&self, function: &str) -> Option<&Arc<FunctionBinding>> {
        self.functions.get(function)
    }
}

/// How a binding's implementation is located.
enum ImplSource {
    /// `"module:qualname"`, resolved through the system's `SymbolResolver`
    /// on first call.
    Symbol(String),
    /// Held directly; used for the library's own default implementations.
    Direct(ImplFn),
}

impl std::fmt::Debug for ImplSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImplSource::Symbol(s) => f.debug_tuple("Symbol").field(s).finish(),
            ImplSource::Direct(_) => f.write_str("Direct"),
        }
    }
}

/// One backend's implementation of one dispatchable function.
pub struct FunctionBinding {
    backend: Arc<str>,
    source: ImplSource,
    should_run_ref: Option<String>,
    uses_context: bool,
    additional_docs: Option<String>,
    implementation: OnceLock<ImplFn>,
    predicate: OnceLock<Option<ShouldRunFn>>,
}

impl FunctionBinding {
    /// A binding that calls `f` directly, bypassing symbol resolution.
    pub(crate) fn direct(backend: Arc<str>, f: ImplFn) -> FunctionBinding {
        FunctionBinding {
            backend,
            source: ImplSource::Direct(f),
            should_run_ref: None,
            uses_context: false,
            additional_docs: None,
            implementation: OnceLock::new(),
            predicate: OnceLock::new(),
        }
    }

    pub fn backend_name(&self) -> &Arc<str> {
        &self.backend
    }

    pub fn uses_context(&self) -> bool {
        self.uses_context
    }

    pub fn additional_docs(&self) -> Option<&str> {
        self.additional_docs.as_deref()
    }

    /// The implementation, resolved on first use and cached.
    ///
    /// Two threads may race to resolve; both obtain the same symbol, and the
    /// first store wins.
    pub(crate) fn implementation(
        &self,
        resolver: &dyn SymbolResolver,
    ) -> Result<ImplFn, DispatchError> {
        if let Some(f) = self.implementation.get() {
            return Ok(Arc::clone(f));
        }
        let f = match &self.source {
            ImplSource::Direct(f) => Arc::clone(f),
            ImplSource::Symbol(ident) => {
                resolver.resolve_function(ident).map_err(|source| DispatchError::Resolve {
                    backend: Arc::clone(&self.backend),
                    ident: ident.clone(),
                    source,
                })?
            }
        };
        let _ = self.implementation.set(Arc::clone(&f));
        Ok(f)
    }

    /// The `should_run` predicate, if declared; resolved on first use.
    pub(crate) fn should_run(
        &self,
        resolver: &dyn SymbolResolver,
    ) -> Result<Option<ShouldRunFn>, DispatchError> {
        if let Some(p) = self.predicate.get() {
            return Ok(p.clone());
        }
        let p = match &self.should_run_ref {
            None => None,
            Some(ident) => Some(resolver.resolve_should_run(ident).map_err(|source| {
                DispatchError::Resolve {
                    backend: Arc::clone(&self.backend),
                    ident: ident.clone(),
                    source,
                }
            })?),
        };
        let _ = self.predicate.set(p.clone());
        Ok(p)
    }
}

impl std::fmt::Debug for FunctionBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionBinding")
            .field("backend", &self.backend)
            .field("source", &self.source)
            .field("should_run", &self.should_run_ref)
            .field("uses_context", &self.uses_context)
            .field("resolved", &self.implementation.get().is_some())
            .finish()
    }
}

/// A backend that failed to load, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct BrokenBackend {
    pub name: String,
    pub reason: String,
}

/// The backend set with its resolved base priority order.
pub struct Registry {
    /// All backends including `default`, highest priority first.
    ordered: Vec<Arc<Backend>>,
    by_name: HashMap<Arc<str>, Arc<Backend>>,
    abstracts: AbstractTable,
    set_order: Vec<(String, String)>,
    broken: Vec<BrokenBackend>,
}

impl Registry {
    /// Builds the registry from parsed declarations.
    ///
    /// A declaration that fails validation marks its backend broken; so does
    /// a duplicate name (the later declaration loses).
    pub(crate) fn build(
        decls: Vec<BackendDecl>,
        set_order: Vec<(String, String)>,
        abstracts: AbstractTable,
        mut broken: Vec<BrokenBackend>,
    ) -> Registry {
        let mut backends: Vec<Arc<Backend>> = vec![Arc::new(Backend::default_backend())];
        for decl in &decls {
            if backends.iter().any(|b| b.name() == decl.name) {
                warn!(backend = %decl.name, "backend name already registered, ignoring the later one");
                broken.push(BrokenBackend {
                    name: decl.name.clone(),
                    reason: "duplicate backend name".to_string(),
                });
                continue;
            }
            match Backend::from_decl(decl, &abstracts) {
                Ok(backend) => backends.push(Arc::new(backend)),
                Err(e) => {
                    warn!(backend = %decl.name, error = %e, "skipping broken backend");
                    broken.push(BrokenBackend { name: decl.name.clone(), reason: e.to_string() });
                }
            }
        }

        let mut registry = Registry {
            ordered: backends,
            by_name: HashMap::new(),
            abstracts,
            set_order,
            broken,
        };
        registry.resort();
        registry
    }

    fn resort(&mut self) {
        let edges = priority::collect_edges(&self.ordered, &self.set_order);
        let names: Vec<Arc<str>> =
            self.ordered.iter().map(|b| Arc::clone(b.name_arc())).collect();
        let order = priority::resolve_order(&names, edges);

        let mut by_position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, n)| (&**n, i)).collect();
        self.ordered
            .sort_by_key(|b| by_position.remove(b.name()).expect("every backend was ordered"));
        self.by_name = self
            .ordered
            .iter()
            .map(|b| (Arc::clone(b.name_arc()), Arc::clone(b)))
            .collect();
    }

    /// Adds one backend post-build. The caller (the `Registrar`) is
    /// responsible for clearing the dispatch cache afterwards.
    pub(crate) fn register(&mut self, decl: BackendDecl) -> Result<(), RegistryError> {
        if self.by_name.contains_key(decl.name.as_str()) {
            return Err(RegistryError::Duplicate(decl.name));
        }
        let backend = Backend::from_decl(&decl, &self.abstracts)?;
        self.ordered.push(Arc::new(backend));
        self.resort();
        Ok(())
    }

    /// All backends in base priority order (highest first).
    pub fn ordered(&self) -> &[Arc<Backend>] {
        &self.ordered
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Backend>> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.ordered.iter().map(|b| b.name()).collect()
    }

    /// Backends that failed to load, with the reason.
    pub fn broken(&self) -> &[BrokenBackend] {
        &self.broken
    }

    pub(crate) fn abstracts(&self) -> &AbstractTable {
        &self.abstracts
    }

    /// Non-default bindings for one function id, in base priority order.
    pub(crate) fn bindings_for(
        &self,
        function: &str,
    ) -> Vec<(Arc<Backend>, Arc<FunctionBinding>)> {
        self.ordered
            .iter()
            .filter(|b| !b.is_default())
            .filter_map(|b| b.binding(function).map(|f| (Arc::clone(b), Arc::clone(f))))
            .collect()
    }

    /// Each backend's documentation blurb for one function.
    pub(crate) fn docs_for(&self, function: &str) -> Vec<(Arc<str>, Option<String>)> {
        self.bindings_for(function)
            .into_iter()
            .map(|(b, f)| (Arc::clone(b.name_arc()), f.additional_docs().map(str::to_string)))
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("order", &self.backend_names())
            .field("broken", &self.broken)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(text: &str) -> BackendDecl {
        BackendDecl::parse(text).unwrap()
    }

    fn build(decls: Vec<BackendDecl>) -> Registry {
        Registry::build(decls, Vec::new(), AbstractTable::new(), Vec::new())
    }

    #[test]
    fn default_is_always_present_and_last() {
        let registry = build(vec![
            decl("name = \"b2\"\nprimary_types = [\"m:float\"]\nrequires_opt_in = false\n"),
            decl("name = \"b1\"\nprimary_types = [\"m:int\"]\nrequires_opt_in = false\n"),
        ]);
        assert_eq!(registry.backend_names(), ["b1", "b2", "default"]);
    }

    #[test]
    fn narrower_primary_set_orders_first() {
        // wide accepts {int, float}; narrow accepts {int} only.
        let registry = build(vec![
            decl("name = \"wide\"\nprimary_types = [\"m:int\", \"m:float\"]\nrequires_opt_in = false\n"),
            decl("name = \"narrow\"\nprimary_types = [\"m:int\"]\nrequires_opt_in = false\n"),
        ]);
        assert_eq!(registry.backend_names(), ["narrow", "wide", "default"]);
    }

    #[test]
    fn hint_beats_type_derived_order() {
        let registry = build(vec![
            decl(concat!(
                "name = \"wide\"\n",
                "primary_types = [\"m:int\", \"m:float\"]\n",
                "requires_opt_in = false\n",
                "higher_priority_than = [\"narrow\"]\n",
            )),
            decl("name = \"narrow\"\nprimary_types = [\"m:int\"]\nrequires_opt_in = false\n"),
        ]);
        assert_eq!(registry.backend_names(), ["wide", "narrow", "default"]);
    }

    #[test]
    fn set_order_beats_hints() {
        let registry = Registry::build(
            vec![
                decl("name = \"a\"\nhigher_priority_than = [\"b\"]\n"),
                decl("name = \"b\"\n"),
            ],
            vec![("b".to_string(), "a".to_string())],
            AbstractTable::new(),
            Vec::new(),
        );
        assert_eq!(registry.backend_names(), ["b", "a", "default"]);
    }

    #[test]
    fn broken_backend_is_isolated() {
        let registry = build(vec![
            decl("name = \"ok\"\n"),
            decl("name = \"bad\"\nprimary_types = [\"not a key\"]\n"),
        ]);
        assert_eq!(registry.backend_names(), ["ok", "default"]);
        assert_eq!(registry.broken().len(), 1);
        assert_eq!(registry.broken()[0].name, "bad");
    }

    #[test]
    fn duplicate_name_keeps_the_first() {
        let registry = build(vec![
            decl("name = \"b\"\nprimary_types = [\"m:int\"]\nrequires_opt_in = false\n"),
            decl("name = \"b\"\n"),
        ]);
        assert_eq!(registry.backend_names(), ["b", "default"]);
        assert_eq!(registry.broken().len(), 1);
    }

    #[test]
    fn abstract_spec_requires_registration() {
        let registry = build(vec![decl("name = \"r\"\nprimary_types = [\"@m:Real\"]\n")]);
        assert_eq!(registry.broken().len(), 1);
        assert!(registry.broken()[0].reason.contains("m:Real"));

        let mut abstracts = AbstractTable::new();
        abstracts.register_members(TypeKey::parse("m:Real").unwrap(), vec![]);
        let registry = Registry::build(
            vec![decl("name = \"r\"\nprimary_types = [\"@m:Real\"]\n")],
            Vec::new(),
            abstracts,
            Vec::new(),
        );
        assert!(registry.broken().is_empty());
    }

    #[test]
    fn post_build_register_resorts_and_rejects_duplicates() {
        let mut registry = build(vec![decl("name = \"b\"\n")]);
        registry
            .register(decl("name = \"a\"\nhigher_priority_than = [\"b\"]\n"))
            .unwrap();
        assert_eq!(registry.backend_names(), ["a", "b", "default"]);

        let err = registry.register(decl("name = \"a\"\n")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }

    #[test]
    fn matches_requires_every_chain_covered() {
        let registry = build(vec![decl(concat!(
            "name = \"b\"\n",
            "primary_types = [\"m:int\"]\n",
            "secondary_types = [\"m:float\"]\n",
            "requires_opt_in = false\n",
        ))]);
        let b = registry.get("b").unwrap();
        let int_chain = vec![TypeKey::parse("m:int").unwrap()];
        let float_chain = vec![TypeKey::parse("m:float").unwrap()];
        let str_chain = vec![TypeKey::parse("m:str").unwrap()];

        assert!(b.matches(&[int_chain.clone()], registry.abstracts()));
        assert!(b.matches(&[int_chain.clone(), float_chain.clone()], registry.abstracts()));
        assert!(!b.matches(&[int_chain, str_chain], registry.abstracts()));
        // Secondary-only coverage is not enough to select a backend.
        assert!(!b.matches(&[float_chain], registry.abstracts()));
    }
}
