//! Multi-Backend Function Dispatch
//!
//! shunt lets a scientific computing library declare *dispatchable*
//! functions whose implementation is selected at runtime from the concrete
//! argument types, user-scoped preferences, and the declared capabilities of
//! externally packaged backends:
//!
//! - Backends announce themselves through entry points pointing at a small
//!   TOML declaration file; implementation code is only loaded on first use.
//! - A priority order over backends is resolved from per-backend hints,
//!   environment overrides, and type-specificity, with cycle tolerance.
//! - Users adjust dispatch with scoped, stackable preferences (prioritize,
//!   disable, forced type, tracing) or a process-global frame.
//! - Candidate plans are memoized in a concurrent cache keyed by function,
//!   argument type multiset, and a preference fingerprint.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────┐    ┌───────────────────┐
//! │ entry points │───►│ registry │───►│  dispatch engine  │
//! │ + decl files │    │ +priority│    │  (cache, scopes)  │
//! └──────────────┘    └──────────┘    └─────────┬─────────┘
//!                                               │
//!                               chosen backend implementation
//! ```
//!
//! The library-facing surface is [`BackendSystem`] (build once at startup),
//! [`BackendSystem::dispatchable`] (wrap each substitutable function), and
//! [`BackendOpts`] (re-exported by the library under its own name for
//! users).

pub mod cache;
pub mod context;
pub mod decl;
pub mod engine;
pub mod entry;
pub mod error;
pub mod ident;
pub mod registry;
pub mod resolve;
pub mod state;
pub mod testing;
pub mod trace;
pub mod value;

mod dispatchable;

pub use cache::Plan;
pub use context::DispatchContext;
pub use decl::{BackendDecl, FunctionDecl};
pub use dispatchable::DispatchFn;
pub use engine::{BackendOpts, BackendSystem, BackendSystemBuilder, Registrar};
pub use entry::{DirSource, EntryPoint, EntryPointSource, StaticSource};
pub use error::{ConfigError, DispatchError, ImplError, NoBackend, RegistryError, ResolveError};
pub use ident::{AbstractHook, AbstractTable, MatchMode, Membership, TypeKey, TypeSpec};
pub use registry::{Backend, BrokenBackend, DEFAULT_BACKEND};
pub use resolve::{ImplFn, ShouldRun, ShouldRunFn, SymbolResolver, SymbolTable};
pub use state::{EffectivePrefs, PreferenceState, Scope};
pub use trace::{Outcome, SharedSink, TraceRecord, TraceSink, VecSink};
pub use value::{value, CallArgs, Reflect, Typed, Value};
