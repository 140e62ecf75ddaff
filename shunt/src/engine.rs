//! The backend system and its dispatch engine.
//!
//! [`BackendSystem`] owns everything a library needs for dispatching:
//! the registry (built once from entry points and explicit declarations),
//! the dispatch cache, the symbol resolver, and the per-thread preference
//! scopes. Per call, the engine:
//!
//! 1. Collects the type multiset of the dispatched arguments.
//! 2. Captures the effective preference state and forms the cache key.
//! 3. Uses the cached candidate plan, or builds one: filter by type match,
//!    apply the opt-in rule, reorder by prioritization, place `default`
//!    last.
//! 4. Tries candidates in order, honoring `should_run` deferral; an
//!    implementation error is re-raised, never skipped over.
//!
//! Everything runs on the calling thread; the engine spawns nothing and
//! never suspends on its own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::cache::{DispatchCache, Plan, PlanKey};
use crate::context::DispatchContext;
use crate::decl::BackendDecl;
use crate::entry::{EntryPointSource, Loader};
use crate::error::{DispatchError, NoBackend, RegistryError};
use crate::ident::{AbstractHook, AbstractTable, TypeKey};
use crate::registry::{BrokenBackend, FunctionBinding, Registry, DEFAULT_BACKEND};
use crate::resolve::{ShouldRun, SymbolResolver, SymbolTable};
use crate::state::{EffectivePrefs, PreferenceState, Scope, ScopeStack};
use crate::trace::{Outcome, SharedSink, TraceRecord};
use crate::value::{CallArgs, Value};

/// User-requested preference changes, handed to [`BackendSystem::scope`] or
/// [`BackendSystem::enable_globally`].
///
/// Unknown backend names are silently ignored so user code stays robust
/// across partial installations.
#[derive(Clone, Default)]
pub struct BackendOpts {
    prioritize: Vec<String>,
    disable: Vec<String>,
    forced_type: Option<TypeKey>,
    trace: Option<SharedSink>,
}

impl BackendOpts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends to prioritize, highest first. Also enables opt-in backends.
    pub fn prioritize<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prioritize.extend(names.into_iter().map(Into::into));
        self
    }

    /// Backends to disable within the scope.
    pub fn disable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disable.extend(names.into_iter().map(Into::into));
        self
    }

    /// Dispatch as if this type were among the argument types.
    pub fn forced_type(mut self, key: TypeKey) -> Self {
        self.forced_type = Some(key);
        self
    }

    /// Sink receiving one record per dispatched call within the scope.
    pub fn trace(mut self, sink: SharedSink) -> Self {
        self.trace = Some(sink);
        self
    }
}

/// Builder for a [`BackendSystem`].
pub struct BackendSystemBuilder {
    env_prefix: String,
    sources: Vec<Box<dyn EntryPointSource>>,
    decls: Vec<BackendDecl>,
    abstracts: AbstractTable,
    resolver: Arc<dyn SymbolResolver>,
}

impl BackendSystemBuilder {
    fn new(env_prefix: &str) -> Self {
        BackendSystemBuilder {
            env_prefix: env_prefix.to_string(),
            sources: Vec::new(),
            decls: Vec::new(),
            abstracts: AbstractTable::new(),
            resolver: Arc::new(SymbolTable::new()),
        }
    }

    /// Adds an entry-point source to discover installed backends from.
    pub fn source(mut self, source: impl EntryPointSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Registers a backend declaration directly, ahead of discovered ones.
    /// Mainly for libraries bundling internal backends, and for tests.
    pub fn backend(mut self, decl: BackendDecl) -> Self {
        self.decls.push(decl);
        self
    }

    /// Registers the membership hook for an abstract base type.
    pub fn register_abstract(mut self, base: TypeKey, hook: AbstractHook) -> Self {
        self.abstracts.register(base, hook);
        self
    }

    /// Replaces the symbol resolver (tests substitute their own tables).
    pub fn resolver(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Discovers and loads backends, resolves the priority order, and seals
    /// the registry. Returns the system plus the privileged [`Registrar`].
    pub fn build(self) -> (Arc<BackendSystem>, Registrar) {
        let env = EnvConfig::read(&self.env_prefix);

        let loader = Loader::new(self.sources, env.blocked.clone());
        let mut decls = Vec::new();
        let mut broken: Vec<BrokenBackend> = Vec::new();
        for decl in self.decls {
            if env.blocked.contains(&decl.name) {
                debug!(backend = %decl.name, "explicitly registered backend is blocked, skipping");
                continue;
            }
            decls.push(decl);
        }
        for entry in loader.list() {
            match loader.load(&entry) {
                Ok(decl) => decls.push((*decl).clone()),
                Err(e) => {
                    warn!(backend = %entry.name, error = %e, "skipping broken backend");
                    broken.push(BrokenBackend { name: entry.name, reason: e.to_string() });
                }
            }
        }

        let registry = Registry::build(decls, env.set_order, self.abstracts, broken);

        // Startup prioritization from the environment; unknown names are
        // silently ignored like every other user-supplied name.
        let prioritize: Vec<Arc<str>> = env
            .prioritize
            .iter()
            .filter(|n| registry.contains(n))
            .map(|n| Arc::from(n.as_str()))
            .collect();
        let base = PreferenceState { prioritize, ..PreferenceState::default() };

        let system = Arc::new(BackendSystem {
            registry: RwLock::new(registry),
            cache: DispatchCache::new(),
            resolver: self.resolver,
            scopes: ScopeStack::new(base),
            sealed: AtomicBool::new(true),
        });
        let registrar = Registrar { system: Arc::clone(&system) };
        (system, registrar)
    }
}

/// Values of the `<PREFIX>_*` environment variables, with invalid content
/// degraded to a warning.
struct EnvConfig {
    prioritize: Vec<String>,
    blocked: BTreeSet<String>,
    set_order: Vec<(String, String)>,
}

impl EnvConfig {
    fn read(prefix: &str) -> EnvConfig {
        EnvConfig {
            prioritize: read_name_list(&format!("{prefix}_PRIORITIZE")),
            blocked: read_name_list(&format!("{prefix}_BLOCK")).into_iter().collect(),
            set_order: read_set_order(&format!("{prefix}_SET_ORDER")),
        }
    }
}

fn read_name_list(var: &str) -> Vec<String> {
    let Ok(raw) = std::env::var(var) else {
        return Vec::new();
    };
    let names: Vec<String> =
        raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
    for name in &names {
        if !crate::decl::valid_backend_name(name) {
            warn!(%var, %name, "ignoring environment variable with invalid backend name");
            return Vec::new();
        }
    }
    names
}

/// Parses `"a>b,b>c"` chains into `(higher, lower)` pairs. A name repeated
/// within one chain is inconsistent and voids the variable.
fn read_set_order(var: &str) -> Vec<(String, String)> {
    let Ok(raw) = std::env::var(var) else {
        return Vec::new();
    };
    let mut pairs = Vec::new();
    for chunk in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let names: Vec<&str> = chunk.split('>').map(str::trim).collect();
        let unique: BTreeSet<&str> = names.iter().copied().collect();
        if unique.len() != names.len() {
            warn!(%var, %chunk, "ignoring environment variable with duplicate backend in order");
            return Vec::new();
        }
        for name in &names {
            if !crate::decl::valid_backend_name(name) {
                warn!(%var, %name, "ignoring environment variable with invalid backend name");
                return Vec::new();
            }
        }
        for pair in names.windows(2) {
            pairs.push((pair[0].to_string(), pair[1].to_string()));
        }
    }
    pairs
}

/// The dispatch engine and its owned state.
pub struct BackendSystem {
    registry: RwLock<Registry>,
    cache: DispatchCache,
    resolver: Arc<dyn SymbolResolver>,
    scopes: ScopeStack,
    sealed: AtomicBool,
}

/// Privileged handle for post-build registry mutation.
///
/// Returned once from [`BackendSystemBuilder::build`]; the library holds it
/// (or drops it to freeze the registry for good). Registering a backend
/// clears the dispatch cache.
pub struct Registrar {
    system: Arc<BackendSystem>,
}

impl Registrar {
    pub fn register(&self, decl: BackendDecl) -> Result<(), RegistryError> {
        let mut registry = self.system.registry.write().expect("registry poisoned");
        registry.register(decl)?;
        self.system.cache.clear();
        Ok(())
    }
}

impl BackendSystem {
    /// Starts building a system. `env_prefix` selects the
    /// `<PREFIX>_PRIORITIZE` / `<PREFIX>_BLOCK` / `<PREFIX>_SET_ORDER`
    /// environment variables.
    pub fn builder(env_prefix: &str) -> BackendSystemBuilder {
        BackendSystemBuilder::new(env_prefix)
    }

    /// Opens a preference scope; dropping the returned guard restores the
    /// previous state on any exit path.
    pub fn scope(&self, opts: BackendOpts) -> Scope {
        self.scopes.push(Arc::new(self.frame_from(opts)))
    }

    /// Callable form of [`scope`](Self::scope): runs `f` inside the scope.
    pub fn with_scope<R>(&self, opts: BackendOpts, f: impl FnOnce() -> R) -> R {
        let _scope = self.scope(opts);
        f()
    }

    /// Promotes preferences to the process-global base frame, replacing any
    /// previously installed one.
    pub fn enable_globally(&self, opts: BackendOpts) {
        let replaced = self.scopes.set_global(Arc::new(self.frame_from(opts)));
        if replaced {
            warn!(
                "global backend options were already modified; global changes \
                 should be made once, from the main program"
            );
        }
    }

    /// The effective preference state for the calling thread.
    pub fn current_prefs(&self) -> EffectivePrefs {
        self.scopes.effective()
    }

    /// Backend names in base priority order (highest first).
    pub fn backend_names(&self) -> Vec<String> {
        let registry = self.registry.read().expect("registry poisoned");
        registry.backend_names().into_iter().map(String::from).collect()
    }

    /// Backends that failed to load, with reasons.
    pub fn broken_backends(&self) -> Vec<BrokenBackend> {
        self.registry.read().expect("registry poisoned").broken().to_vec()
    }

    /// Unprivileged mutation path: always refused once the system is built.
    /// Post-init registration goes through the [`Registrar`].
    pub fn register_backend(&self, _decl: BackendDecl) -> Result<(), RegistryError> {
        debug_assert!(self.sealed.load(Ordering::Relaxed));
        Err(RegistryError::Frozen)
    }

    fn frame_from(&self, opts: BackendOpts) -> PreferenceState {
        let registry = self.registry.read().expect("registry poisoned");
        let keep_known = |names: Vec<String>| -> Vec<Arc<str>> {
            names
                .into_iter()
                .filter(|n| {
                    let known = registry.contains(n);
                    if !known {
                        debug!(backend = %n, "unknown backend name in options, ignoring");
                    }
                    known
                })
                .map(|n| Arc::from(n.as_str()))
                .collect()
        };
        PreferenceState {
            prioritize: keep_known(opts.prioritize),
            disable: keep_known(opts.disable),
            forced_type: opts.forced_type,
            trace: opts.trace,
        }
    }

    /// One dispatched call. `target` is fixed per function at registration.
    pub(crate) fn dispatch(
        &self,
        target: &DispatchTarget,
        args: &CallArgs,
    ) -> Result<Value, DispatchError> {
        let prefs = Arc::new(self.scopes.effective());
        let (types, chains) = dispatched_types(target, args);
        let plan = self.plan(target, &types, &chains, &prefs);

        let mut outcomes: Vec<(Arc<str>, Outcome)> = Vec::new();
        for (backend, binding) in plan.iter() {
            let name = Arc::clone(backend.name_arc());
            let ctx = DispatchContext::new(
                types.clone(),
                prefs.forced_type.clone(),
                Arc::clone(&name),
                Arc::clone(&prefs),
            );

            let predicate = match binding.should_run(&*self.resolver) {
                Ok(p) => p,
                Err(e) => {
                    outcomes.push((name, Outcome::Errored));
                    self.emit_trace(target, &prefs, outcomes);
                    return Err(e);
                }
            };
            if let Some(predicate) = predicate {
                if predicate(&ctx, args) == ShouldRun::Defer {
                    outcomes.push((name, Outcome::Deferred));
                    continue;
                }
            }

            let implementation = match binding.implementation(&*self.resolver) {
                Ok(f) => f,
                Err(e) => {
                    outcomes.push((name, Outcome::Errored));
                    self.emit_trace(target, &prefs, outcomes);
                    return Err(e);
                }
            };
            match implementation(&ctx, args) {
                Ok(result) => {
                    outcomes.push((name, Outcome::Called));
                    self.emit_trace(target, &prefs, outcomes);
                    return Ok(result);
                }
                Err(source) => {
                    // Implementation errors are not deferrals: record, then
                    // re-raise without trying further backends.
                    outcomes.push((Arc::clone(&name), Outcome::Errored));
                    self.emit_trace(target, &prefs, outcomes);
                    return Err(DispatchError::Implementation { backend: name, source });
                }
            }
        }

        self.emit_trace(target, &prefs, outcomes.clone());
        Err(DispatchError::NoBackend(NoBackend {
            function: Arc::clone(&target.id),
            types,
            considered: outcomes,
        }))
    }

    /// The candidate plan the engine would use for these arguments, without
    /// calling anything.
    pub(crate) fn plan_for(&self, target: &DispatchTarget, args: &CallArgs) -> Arc<Plan> {
        let prefs = Arc::new(self.scopes.effective());
        let (types, chains) = dispatched_types(target, args);
        self.plan(target, &types, &chains, &prefs)
    }

    fn plan(
        &self,
        target: &DispatchTarget,
        types: &[TypeKey],
        chains: &[Vec<TypeKey>],
        prefs: &EffectivePrefs,
    ) -> Arc<Plan> {
        let key = PlanKey {
            function: Arc::clone(&target.id),
            types: types.to_vec(),
            fingerprint: prefs.fingerprint(),
        };
        if let Some(plan) = self.cache.get(&key) {
            return plan;
        }

        debug!(function = %target.id, "dispatch cache miss, building plan");
        let plan = Arc::new(self.build_plan(target, chains, prefs));
        self.cache.insert(key, Arc::clone(&plan));
        plan
    }

    fn build_plan(
        &self,
        target: &DispatchTarget,
        chains: &[Vec<TypeKey>],
        prefs: &EffectivePrefs,
    ) -> Plan {
        let registry = self.registry.read().expect("registry poisoned");
        let default_candidate = || {
            registry
                .get(DEFAULT_BACKEND)
                .map(|b| (Arc::clone(b), Arc::clone(&target.default_binding)))
        };

        // With nothing to dispatch on and no forced type, only the library
        // default runs; prioritized backends are not consulted.
        if chains.is_empty() && prefs.forced_type.is_none() {
            let candidates = if prefs.is_disabled(DEFAULT_BACKEND) {
                Vec::new()
            } else {
                default_candidate().into_iter().collect()
            };
            return Plan::new(candidates);
        }

        // For matching purposes the forced type behaves like one more
        // dispatched argument.
        let mut match_chains = chains.to_vec();
        if let Some(forced) = &prefs.forced_type {
            if !match_chains.iter().any(|c| c.first() == Some(forced)) {
                match_chains.push(vec![forced.clone()]);
            }
        }

        let mut matched = Vec::new();
        for (backend, binding) in registry.bindings_for(&target.id) {
            if prefs.is_disabled(backend.name()) {
                continue;
            }
            if !backend.matches(&match_chains, registry.abstracts()) {
                continue;
            }
            if backend.requires_opt_in() && !prefs.is_prioritized(backend.name()) {
                let via_forced = prefs
                    .forced_type
                    .as_ref()
                    .is_some_and(|t| backend.primary_accepts(t, registry.abstracts()));
                if !via_forced {
                    continue;
                }
            }
            matched.push((backend, binding));
        }

        // Prioritized backends first, in prioritize-list order; the rest
        // keep the registry base order. `default` goes last.
        let mut candidates = Vec::with_capacity(matched.len() + 1);
        for name in &prefs.prioritize {
            if let Some(pos) = matched.iter().position(|(b, _)| b.name() == &**name) {
                candidates.push(matched.remove(pos));
            }
        }
        candidates.extend(matched);

        // The default backend declares no types, so it cannot honor a
        // forced-type request; otherwise it is the final fallback.
        if prefs.forced_type.is_none() && !prefs.is_disabled(DEFAULT_BACKEND) {
            candidates.extend(default_candidate());
        }
        Plan::new(candidates)
    }

    fn emit_trace(
        &self,
        target: &DispatchTarget,
        prefs: &EffectivePrefs,
        outcomes: Vec<(Arc<str>, Outcome)>,
    ) {
        if let Some(sink) = &prefs.trace {
            sink.record(TraceRecord { function: Arc::clone(&target.id), outcomes });
        }
    }

    pub(crate) fn docs_for(&self, function: &str) -> Vec<(Arc<str>, Option<String>)> {
        self.registry.read().expect("registry poisoned").docs_for(function)
    }
}

impl std::fmt::Debug for BackendSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read().expect("registry poisoned");
        f.debug_struct("BackendSystem")
            .field("registry", &*registry)
            .field("cached_plans", &self.cache.len())
            .finish()
    }
}

/// Per-function dispatch metadata, fixed at registration time.
pub(crate) struct DispatchTarget {
    /// Library-qualified function id, `"module:qualname"`.
    pub id: Arc<str>,
    /// Positions of the dispatched parameters.
    pub positions: Vec<usize>,
    /// Binding wrapping the library's default implementation.
    pub default_binding: Arc<FunctionBinding>,
}

/// Unique type chains of the dispatched arguments, plus the sorted key list.
fn dispatched_types(target: &DispatchTarget, args: &CallArgs) -> (Vec<TypeKey>, Vec<Vec<TypeKey>>) {
    let mut by_key: BTreeMap<TypeKey, Vec<TypeKey>> = BTreeMap::new();
    for &position in &target.positions {
        if let Some(value) = args.get(position) {
            by_key.entry(value.type_key()).or_insert_with(|| value.type_chain());
        }
    }
    let types = by_key.keys().cloned().collect();
    let chains = by_key.into_values().collect();
    (types, chains)
}
