//! Error surface of the dispatch engine.
//!
//! The enumerated kinds are deliberately small:
//!
//! - [`ConfigError`]: a malformed declaration or registration, raised at
//!   registry build time and isolated per backend.
//! - [`RegistryError`]: post-init registry mutation problems.
//! - [`ResolveError`]: a symbol identifier that cannot be resolved.
//! - [`DispatchError`]: raised from a dispatchable call site.
//!
//! Priority cycles are *not* an error kind: cycle breaking emits a
//! diagnostic and resolution proceeds with the acyclic subset.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::ident::TypeKey;
use crate::trace::Outcome;

/// Error type implementations may return; re-raised unchanged by the engine.
pub type ImplError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Malformed configuration, detected while building or mutating the registry.
///
/// A `ConfigError` in one backend's declaration marks that backend broken and
/// does not affect the others.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid type identifier {raw:?}, expected \"module_path:qualified_name\"")]
    TypeIdentifier { raw: String },

    #[error("invalid backend name {name:?}")]
    BackendName { name: String },

    #[error("entry point {entry:?} declares backend name {declared:?}")]
    NameMismatch { entry: String, declared: String },

    #[error("declaration for backend {backend:?} is missing required field {field:?}")]
    MissingField { backend: String, field: &'static str },

    #[error("abstract type {key} is not registered with the backend system")]
    UnknownAbstract { key: TypeKey },

    #[error("cannot read declaration file {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse declaration file {path:?}: {message}")]
    Parse { path: std::path::PathBuf, message: String },

    #[error("dispatchable function {function:?}: {message}")]
    Dispatchable { function: String, message: String },
}

/// Post-init registry mutation problems.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry is sealed; only the privileged `Registrar` may mutate it.
    #[error("registry is frozen; backends can only be added through the Registrar before sealing")]
    Frozen,

    #[error("backend {0:?} is already registered")]
    Duplicate(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A `"module:qualname"` identifier that could not be resolved to a symbol.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no symbol registered for identifier {0:?}")]
    NotFound(String),
}

/// Raised from a dispatchable call site.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every candidate deferred, or none matched the argument types.
    #[error("{0}")]
    NoBackend(NoBackend),

    /// The chosen implementation failed. The engine records the outcome in
    /// the trace and re-raises; no further backend is attempted.
    #[error("backend {backend:?} failed")]
    Implementation {
        backend: Arc<str>,
        #[source]
        source: ImplError,
    },

    /// A binding's implementation or `should_run` symbol could not be
    /// resolved on first use.
    #[error("backend {backend:?}: cannot resolve {ident:?}")]
    Resolve {
        backend: Arc<str>,
        ident: String,
        #[source]
        source: ResolveError,
    },
}

/// Details of an exhausted dispatch: which function, for which types, and
/// what happened to each considered backend.
#[derive(Debug)]
pub struct NoBackend {
    pub function: Arc<str>,
    pub types: Vec<TypeKey>,
    pub considered: Vec<(Arc<str>, Outcome)>,
}

impl fmt::Display for NoBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no backend for {} with types [", self.function)?;
        for (i, t) in self.types.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, "]")?;
        if self.considered.is_empty() {
            write!(f, "; no backend matched")?;
        } else {
            write!(f, "; considered: ")?;
            for (i, (name, outcome)) in self.considered.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{name} ({outcome})")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backend_display_lists_considered() {
        let err = NoBackend {
            function: Arc::from("lib:divide"),
            types: vec![TypeKey::parse("m:int").unwrap()],
            considered: vec![(Arc::from("b1"), Outcome::Deferred)],
        };
        let text = err.to_string();
        assert!(text.contains("lib:divide"));
        assert!(text.contains("m:int"));
        assert!(text.contains("b1 (deferred)"));
    }

    #[test]
    fn no_backend_display_without_candidates() {
        let err = NoBackend {
            function: Arc::from("lib:divide"),
            types: vec![],
            considered: vec![],
        };
        assert!(err.to_string().contains("no backend matched"));
    }
}
