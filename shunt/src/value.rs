//! The value side of type identity: dynamically typed arguments.
//!
//! Dispatchable functions exchange arguments as [`Value`]s, boxed trait
//! objects that report their own [`TypeKey`] and inheritance chain. Library
//! and backend types opt in by implementing [`Typed`]; the blanket impl
//! takes care of the object-safe [`Reflect`] plumbing.
//!
//! Rust has no inheritance, so the "chain" of a plain type is just itself.
//! Types that want to be matched by `~`-specs of another key list that key
//! in [`Typed::ancestors`].

use std::any::Any;
use std::collections::BTreeSet;

use crate::ident::TypeKey;

/// Library-facing trait: gives a type its stable key and ancestor chain.
pub trait Typed: Any {
    /// The canonical key of this type. The default derives it from the Rust
    /// type path.
    fn type_key() -> TypeKey
    where
        Self: Sized,
    {
        TypeKey::of::<Self>()
    }

    /// Keys of the type's ancestors, nearest first. Empty for most types.
    fn ancestors() -> Vec<TypeKey>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

/// Object-safe view of a dispatched value.
pub trait Reflect: Any {
    /// Key of the concrete type.
    fn type_key(&self) -> TypeKey;

    /// The concrete type's key followed by its ancestors' keys.
    fn type_chain(&self) -> Vec<TypeKey>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Typed> Reflect for T {
    fn type_key(&self) -> TypeKey {
        T::type_key()
    }

    fn type_chain(&self) -> Vec<TypeKey> {
        let mut chain = vec![T::type_key()];
        chain.extend(T::ancestors());
        chain
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl std::fmt::Debug for dyn Reflect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Value").field(&self.type_key()).finish()
    }
}

/// A dynamically typed argument or result.
pub type Value = Box<dyn Reflect>;

/// Boxes a typed value for a dispatchable call.
pub fn value<T: Typed>(v: T) -> Value {
    Box::new(v)
}

impl Typed for i64 {}
impl Typed for f64 {}
impl Typed for bool {}
impl Typed for String {}

/// Positional argument pack of one dispatchable call.
///
/// Dispatched parameters are declared by name at registration time and
/// resolved to positions once, so the call path works purely by index.
#[derive(Default)]
pub struct CallArgs {
    args: Vec<Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>) -> Self {
        CallArgs { args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Reflect> {
        self.args.get(index).map(|v| v.as_ref())
    }

    /// Borrows the argument at `index` as a concrete type.
    pub fn downcast_ref<T: Any>(&self, index: usize) -> Option<&T> {
        self.args.get(index)?.as_any().downcast_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Reflect> {
        self.args.iter().map(|v| v.as_ref())
    }
}

impl std::fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.args.iter().map(|v| v.type_key()))
            .finish()
    }
}

/// Unique keys of the values at the dispatched parameter positions.
///
/// Positions past the end of the argument list are ignored; they correspond
/// to optional parameters the caller left out.
pub fn collect_type_multiset(args: &CallArgs, positions: &[usize]) -> BTreeSet<TypeKey> {
    positions
        .iter()
        .filter_map(|&p| args.get(p))
        .map(|v| v.type_key())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Velocity(#[allow(dead_code)] f64);
    impl Typed for Velocity {}

    struct FastVelocity(#[allow(dead_code)] f64);
    impl Typed for FastVelocity {
        fn ancestors() -> Vec<TypeKey> {
            vec![<Velocity as Typed>::type_key()]
        }
    }

    #[test]
    fn chain_starts_with_own_key() {
        let v = value(FastVelocity(3.0));
        let chain = v.type_chain();
        assert_eq!(chain[0], <FastVelocity as Typed>::type_key());
        assert_eq!(chain[1], <Velocity as Typed>::type_key());
    }

    #[test]
    fn multiset_is_unique_by_key() {
        let args = CallArgs::new(vec![value(1i64), value(2i64), value(3.0f64)]);
        let types = collect_type_multiset(&args, &[0, 1, 2]);
        assert_eq!(types.len(), 2);
        assert!(types.contains(&TypeKey::of::<i64>()));
        assert!(types.contains(&TypeKey::of::<f64>()));
    }

    #[test]
    fn multiset_ignores_undispatched_and_missing_positions() {
        let args = CallArgs::new(vec![value(1i64), value("x".to_string())]);
        let types = collect_type_multiset(&args, &[0, 7]);
        assert_eq!(types.len(), 1);
        assert!(types.contains(&TypeKey::of::<i64>()));
    }

    #[test]
    fn downcast_roundtrip() {
        let args = CallArgs::new(vec![value(41i64)]);
        assert_eq!(args.downcast_ref::<i64>(0), Some(&41));
        assert!(args.downcast_ref::<f64>(0).is_none());
    }
}
