//! Type identity: stable keys for runtime types and the specs that match them.
//!
//! Every value the engine dispatches on is identified by a [`TypeKey`], the
//! string `"module_path:qualified_name"`. Backends declare which types they
//! accept with [`TypeSpec`]s, which come in three match modes:
//!
//! - `"m:n"` matches exactly the type with key `m:n`
//! - `"~m:n"` matches `m:n` and any type whose ancestor chain contains it
//! - `"@m:n"` matches any registered descendant of the abstract type `m:n`
//!
//! Abstract membership is answered by a hook the library registers in an
//! [`AbstractTable`]; the hook may answer [`Membership::Unknown`], which is
//! treated as no-match for routing purposes.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ConfigError;

/// Canonical identifier of a concrete type: `"module_path:qualified_name"`.
///
/// Equality, ordering and hashing are by the underlying string, so keys are
/// stable across processes as long as the type path is.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeKey(Arc<str>);

impl TypeKey {
    /// Builds a key from a raw `"m:n"` string.
    ///
    /// The string must contain exactly one `:` separating a non-empty module
    /// path from a non-empty qualified name. (`::` within the module path is
    /// fine; the separator is the single trailing `:`.)
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let Some((module, name)) = split_identifier(raw) else {
            return Err(ConfigError::TypeIdentifier { raw: raw.to_string() });
        };
        if module.is_empty() || name.is_empty() {
            return Err(ConfigError::TypeIdentifier { raw: raw.to_string() });
        }
        Ok(TypeKey(Arc::from(raw)))
    }

    /// Derives the key for a Rust type from its `std::any::type_name`.
    ///
    /// `my_lib::types::Matrix` becomes `"my_lib::types:Matrix"`. Primitive
    /// names without a path (`i64`, `f64`) are keyed under `"builtin"`.
    pub fn of<T: 'static>() -> Self {
        let full = std::any::type_name::<T>();
        match full.rsplit_once("::") {
            Some((module, name)) => TypeKey(Arc::from(format!("{module}:{name}"))),
            None => TypeKey(Arc::from(format!("builtin:{full}"))),
        }
    }

    /// The module-path part of the key.
    pub fn module(&self) -> &str {
        split_identifier(&self.0).map(|(m, _)| m).unwrap_or("")
    }

    /// The qualified-name part of the key.
    pub fn name(&self) -> &str {
        split_identifier(&self.0).map(|(_, n)| n).unwrap_or(&self.0)
    }

    /// The full `"m:n"` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Splits `"a::b:c"` into `("a::b", "c")`.
///
/// The last `:` that is not part of a `::` pair is the separator.
fn split_identifier(raw: &str) -> Option<(&str, &str)> {
    let bytes = raw.as_bytes();
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        if bytes[i] != b':' {
            continue;
        }
        // Part of a `::` path segment, not the module/name separator.
        if i > 0 && bytes[i - 1] == b':' {
            i -= 1;
            continue;
        }
        if i + 1 < bytes.len() && bytes[i + 1] == b':' {
            continue;
        }
        return Some((&raw[..i], &raw[i + 1..]));
    }
    None
}

/// How a [`TypeSpec`] matches candidate types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Only the exact type.
    Exact,
    /// The type or any of its ancestors.
    Subclass,
    /// Any registered descendant of an abstract base.
    Abstract,
}

/// A single type specification from a backend declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSpec {
    mode: MatchMode,
    key: TypeKey,
}

impl TypeSpec {
    pub fn new(mode: MatchMode, key: TypeKey) -> Self {
        TypeSpec { mode, key }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Whether this spec matches a value whose inheritance chain is `chain`
    /// (most derived type first).
    ///
    /// Abstract specs consult the hook registered in `abstracts`; a missing
    /// hook or an [`Membership::Unknown`] answer is a no-match.
    pub fn matches(&self, chain: &[TypeKey], abstracts: &AbstractTable) -> bool {
        match self.mode {
            MatchMode::Exact => chain.first() == Some(&self.key),
            MatchMode::Subclass => chain.contains(&self.key),
            MatchMode::Abstract => match abstracts.query(&self.key, chain) {
                Membership::Yes => true,
                Membership::No | Membership::Unknown => false,
            },
        }
    }

    /// Whether every type accepted by `other` is also accepted by this spec.
    ///
    /// Used to derive priority edges between backends; abstract specs are
    /// incomparable and never cover or get covered.
    pub fn covers(&self, other: &TypeSpec) -> bool {
        match (self.mode, other.mode) {
            (MatchMode::Abstract, _) | (_, MatchMode::Abstract) => false,
            (MatchMode::Exact, MatchMode::Exact) => self.key == other.key,
            (MatchMode::Exact, MatchMode::Subclass) => false,
            (MatchMode::Subclass, _) => self.key == other.key,
        }
    }
}

impl FromStr for TypeSpec {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (mode, rest) = match raw.as_bytes().first() {
            Some(b'~') => (MatchMode::Subclass, &raw[1..]),
            Some(b'@') => (MatchMode::Abstract, &raw[1..]),
            _ => (MatchMode::Exact, raw),
        };
        Ok(TypeSpec { mode, key: TypeKey::parse(rest)? })
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.mode {
            MatchMode::Exact => "",
            MatchMode::Subclass => "~",
            MatchMode::Abstract => "@",
        };
        write!(f, "{prefix}{}", self.key)
    }
}

/// Answer of an abstract-membership hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Yes,
    No,
    /// The hook cannot decide. Treated as no-match for routing, but not as
    /// an error.
    Unknown,
}

/// Membership hook for one abstract base type.
///
/// Receives the concrete type's key and its full ancestor chain and decides
/// whether the type counts as a descendant of the base.
pub type AbstractHook = Arc<dyn Fn(&TypeKey, &[TypeKey]) -> Membership + Send + Sync>;

/// Registered abstract base types and their membership hooks.
///
/// `@`-prefixed specs in a backend declaration require the named base to be
/// registered here by the time the registry is built; an unregistered base
/// is a per-backend configuration error.
#[derive(Clone, Default)]
pub struct AbstractTable {
    hooks: HashMap<TypeKey, AbstractHook>,
}

impl AbstractTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the hook for an abstract base type.
    pub fn register(&mut self, base: TypeKey, hook: AbstractHook) {
        self.hooks.insert(base, hook);
    }

    /// Convenience: registers a hook that answers [`Membership::Yes`] for
    /// exactly the listed concrete keys.
    pub fn register_members(&mut self, base: TypeKey, members: Vec<TypeKey>) {
        self.register(
            base,
            Arc::new(move |key, _chain| {
                if members.contains(key) {
                    Membership::Yes
                } else {
                    Membership::No
                }
            }),
        );
    }

    pub fn contains(&self, base: &TypeKey) -> bool {
        self.hooks.contains_key(base)
    }

    fn query(&self, base: &TypeKey, chain: &[TypeKey]) -> Membership {
        let Some(hook) = self.hooks.get(base) else {
            return Membership::Unknown;
        };
        let Some(concrete) = chain.first() else {
            return Membership::No;
        };
        hook(concrete, chain)
    }
}

// Hooks are closures, so only the registered keys are printable.
impl fmt::Debug for AbstractTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbstractTable")
            .field("bases", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}
