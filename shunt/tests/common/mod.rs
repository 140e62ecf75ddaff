//! Shared fixtures: demo value types and the small seed library
//! (`divide` plus two typed backends) used across the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use shunt::testing::TestBackend;
use shunt::{
    value, BackendSystem, CallArgs, DispatchFn, Outcome, Registrar, SymbolTable, TraceRecord,
    TypeKey, Typed, Value,
};

pub const DIVIDE: &str = "demo::library:divide";

pub struct Int(pub i64);

impl Typed for Int {
    fn type_key() -> TypeKey {
        TypeKey::parse("m:int").unwrap()
    }
}

pub struct Float(pub f64);

impl Typed for Float {
    fn type_key() -> TypeKey {
        TypeKey::parse("m:float").unwrap()
    }
}

pub struct Complex(pub f64, pub f64);

impl Typed for Complex {
    fn type_key() -> TypeKey {
        TypeKey::parse("m:complex").unwrap()
    }
}

pub fn int(v: i64) -> Value {
    value(Int(v))
}

pub fn float(v: f64) -> Value {
    value(Float(v))
}

pub fn complex(re: f64, im: f64) -> Value {
    value(Complex(re, im))
}

pub fn args(values: Vec<Value>) -> CallArgs {
    CallArgs::new(values)
}

/// The seed system: `b1` works natively on floats and tolerates ints,
/// `b2` works natively on floats and tolerates complex values.
pub fn seed_system(env_prefix: &str) -> (Arc<BackendSystem>, Registrar, DispatchFn) {
    let table = Arc::new(SymbolTable::new());
    let b1 = TestBackend::new("b1")
        .primary(&["m:float"])
        .secondary(&["m:int"])
        .implements(DIVIDE)
        .register(&table);
    let b2 = TestBackend::new("b2")
        .primary(&["m:float"])
        .secondary(&["m:complex"])
        .implements(DIVIDE)
        .register(&table);

    let (system, registrar) = BackendSystem::builder(env_prefix)
        .backend(b1)
        .backend(b2)
        .resolver(table)
        .build();
    let divide = default_divide(&system);
    (system, registrar, divide)
}

/// Registers the seed `divide` with a default implementation that reports
/// itself the way the test backends do.
pub fn default_divide(system: &Arc<BackendSystem>) -> DispatchFn {
    system
        .dispatchable(DIVIDE, &["x", "y"], &["x", "y"], |_ctx, _args| {
            Ok(value("default".to_string()))
        })
        .unwrap()
}

/// Flattens a trace record for compact assertions.
pub fn outcomes(record: &TraceRecord) -> Vec<(String, Outcome)> {
    record
        .outcomes
        .iter()
        .map(|(name, outcome)| (name.to_string(), *outcome))
        .collect()
}
