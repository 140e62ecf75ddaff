//! Preference scope stacking, the process-global frame, and the
//! `DispatchContext` handed to backends.

mod common;

use std::sync::Arc;

use common::{args, default_divide, float, outcomes, seed_system, DIVIDE};
use shunt::testing::{called_backend, TestBackend};
use shunt::{
    value, BackendOpts, BackendSystem, FunctionDecl, Outcome, SymbolTable, TypeKey, VecSink,
};

#[test]
fn closing_a_scope_restores_the_previous_state_exactly() {
    let (system, _registrar, _divide) = seed_system("SHUNT_T_ISO");
    let before = system.current_prefs().fingerprint();

    {
        let _scope = system.scope(
            BackendOpts::new()
                .prioritize(["b2"])
                .disable(["b1"])
                .forced_type(TypeKey::parse("m:float").unwrap()),
        );
        assert_ne!(system.current_prefs().fingerprint(), before);
    }

    assert_eq!(system.current_prefs().fingerprint(), before);
}

#[test]
fn with_scope_runs_the_closure_inside_the_scope() {
    let (system, _registrar, divide) = seed_system("SHUNT_T_WITH");

    let chosen = system.with_scope(BackendOpts::new().prioritize(["b2"]), || {
        let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
        called_backend(&result).to_string()
    });
    assert_eq!(chosen, "b2");

    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b1");
}

#[test]
fn unknown_backend_names_are_silently_ignored() {
    let (system, _registrar, divide) = seed_system("SHUNT_T_UNKNOWN");
    let _scope = system.scope(
        BackendOpts::new().prioritize(["no-such-backend", "b2"]).disable(["also-missing"]),
    );

    assert!(!system.current_prefs().is_prioritized("no-such-backend"));
    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b2");
}

#[test]
fn disable_removes_a_backend_and_inner_prioritize_reenables_it() {
    let (system, _registrar, divide) = seed_system("SHUNT_T_DISABLE");

    let _outer = system.scope(BackendOpts::new().disable(["b1"]));
    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b2");

    let _inner = system.scope(BackendOpts::new().prioritize(["b1"]));
    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b1");
}

#[test]
fn global_frame_applies_across_threads_until_replaced() {
    let (system, _registrar, divide) = seed_system("SHUNT_T_GLOBAL");
    system.enable_globally(BackendOpts::new().prioritize(["b2"]));

    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b2");

    let remote_system = Arc::clone(&system);
    let remote = std::thread::spawn(move || {
        remote_system.current_prefs().is_prioritized("b2")
    });
    assert!(remote.join().unwrap(), "global frame is shared across threads");

    // Re-installing replaces the previous global frame wholesale.
    system.enable_globally(BackendOpts::new());
    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b1");
}

#[test]
fn thread_local_scopes_do_not_leak_across_threads() {
    let (system, _registrar, _divide) = seed_system("SHUNT_T_TLS");
    let _scope = system.scope(BackendOpts::new().prioritize(["b2"]));

    let remote_system = Arc::clone(&system);
    let remote = std::thread::spawn(move || {
        remote_system.current_prefs().is_prioritized("b2")
    });
    assert!(!remote.join().unwrap());
}

#[test]
fn inner_scope_without_trace_pauses_the_outer_sink() {
    let (system, _registrar, divide) = seed_system("SHUNT_T_TRACEPAUSE");
    let sink = VecSink::new();
    let _outer = system.scope(BackendOpts::new().trace(sink.clone()));

    divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(sink.snapshot().len(), 1);

    {
        let _inner = system.scope(BackendOpts::new());
        divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
        assert_eq!(sink.snapshot().len(), 1, "outer tracing is paused");
    }

    divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    let records = sink.snapshot();
    assert_eq!(records.len(), 2);
    assert_eq!(outcomes(&records[1]), [("b1".to_string(), Outcome::Called)]);
}

#[test]
fn context_reports_backend_types_and_prioritization() {
    let table = Arc::new(SymbolTable::new());
    let b1 = TestBackend::new("b1")
        .primary(&["m:float"])
        .implements_as(DIVIDE, |ctx, _args| {
            assert_eq!(ctx.types(), [TypeKey::parse("m:float").unwrap()]);
            assert!(ctx.forced_type().is_none());
            Ok(value(format!("{}:{}", ctx.backend_name(), ctx.prioritized())))
        })
        .register(&table);
    let (system, _registrar) = BackendSystem::builder("SHUNT_T_CTX")
        .backend(b1)
        .resolver(table)
        .build();
    let divide = default_divide(&system);

    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b1:false");

    let _scope = system.scope(BackendOpts::new().prioritize(["b1"]));
    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b1:true");
}

#[test]
fn context_carries_the_forced_type() {
    let table = Arc::new(SymbolTable::new());
    let b1 = TestBackend::new("b1")
        .primary(&["m:float"])
        .secondary(&["m:int"])
        .implements_as(DIVIDE, |ctx, _args| {
            let forced = ctx.forced_type().expect("forced type is visible to backends");
            Ok(value(forced.to_string()))
        })
        .register(&table);
    let (system, _registrar) = BackendSystem::builder("SHUNT_T_CTXFORCE")
        .backend(b1)
        .resolver(table)
        .build();
    let divide = default_divide(&system);

    let _scope =
        system.scope(BackendOpts::new().forced_type(TypeKey::parse("m:float").unwrap()));
    let result = divide.call(&args(vec![common::int(1), common::int(2)])).unwrap();
    assert_eq!(called_backend(&result), "m:float");
}

#[test]
fn backend_docs_surface_declaration_blurbs() {
    let table = Arc::new(SymbolTable::new());
    table.register_function("b1_impl:divide", |_ctx, _args| Ok(value("b1".to_string())));

    let mut decl = shunt::BackendDecl::parse(concat!(
        "name = \"b1\"\n",
        "primary_types = [\"m:float\"]\n",
        "requires_opt_in = false\n",
    ))
    .unwrap();
    decl.functions.insert(
        DIVIDE.to_string(),
        FunctionDecl {
            function: Some("b1_impl:divide".to_string()),
            should_run: None,
            uses_context: None,
            additional_docs: Some("Runs the float path.".to_string()),
        },
    );

    let (system, _registrar) = BackendSystem::builder("SHUNT_T_DOCS")
        .backend(decl)
        .resolver(table)
        .build();
    let divide = default_divide(&system);

    let docs = divide.backend_docs();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].0, "b1");
    assert_eq!(docs[0].1.as_deref(), Some("Runs the float path."));
}
