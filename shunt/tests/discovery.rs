//! Discovery through entry-point sources: declaration files on disk,
//! per-backend failure isolation, and block-listing.

mod common;

use std::sync::Arc;

use common::{args, default_divide, float, DIVIDE};
use shunt::testing::called_backend;
use shunt::{BackendSystem, DirSource, SymbolTable};

fn write_decl(dir: &std::path::Path, name: &str, body: &str) {
    std::fs::write(dir.join(format!("{name}.toml")), body).unwrap();
}

fn b1_decl() -> String {
    format!(
        concat!(
            "name = \"b1\"\n",
            "primary_types = [\"m:float\"]\n",
            "requires_opt_in = false\n",
            "\n",
            "[functions.\"{}\"]\n",
            "function = \"b1_impl:divide\"\n",
        ),
        DIVIDE
    )
}

fn table_with_b1() -> Arc<SymbolTable> {
    let table = Arc::new(SymbolTable::new());
    table.register_function("b1_impl:divide", |_ctx, _args| {
        Ok(shunt::value("b1".to_string()))
    });
    table
}

#[test]
fn backends_are_discovered_from_declaration_files() {
    let dir = tempfile::tempdir().unwrap();
    write_decl(dir.path(), "b1", &b1_decl());

    let (system, _registrar) = BackendSystem::builder("SHUNT_T_DISC")
        .source(DirSource::single(dir.path()))
        .resolver(table_with_b1())
        .build();
    assert_eq!(system.backend_names(), ["b1", "default"]);

    let divide = default_divide(&system);
    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b1");
}

#[test]
fn a_broken_declaration_does_not_take_down_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    write_decl(dir.path(), "b1", &b1_decl());
    write_decl(dir.path(), "broken", "name = \"broken\"\nprimary_types = [\"no separator\"]\n");
    write_decl(dir.path(), "mismatched", "name = \"something-else\"\n");

    let (system, _registrar) = BackendSystem::builder("SHUNT_T_DISCBROKEN")
        .source(DirSource::single(dir.path()))
        .resolver(table_with_b1())
        .build();

    assert_eq!(system.backend_names(), ["b1", "default"]);
    let broken = system.broken_backends();
    let mut names: Vec<&str> = broken.iter().map(|b| b.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, ["broken", "mismatched"]);

    let divide = default_divide(&system);
    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b1");
}

#[test]
fn blocked_backends_are_never_read() {
    let dir = tempfile::tempdir().unwrap();
    write_decl(dir.path(), "b1", &b1_decl());
    // Unreadable on purpose: if the loader touched it, the backend would be
    // reported broken rather than absent.
    write_decl(dir.path(), "blocked-one", "this is not even toml [");

    std::env::set_var("SHUNT_T_DISCBLOCK_BLOCK", "blocked-one");
    let (system, _registrar) = BackendSystem::builder("SHUNT_T_DISCBLOCK")
        .source(DirSource::single(dir.path()))
        .resolver(table_with_b1())
        .build();

    assert_eq!(system.backend_names(), ["b1", "default"]);
    assert!(system.broken_backends().is_empty(), "blocked backends are absent, not broken");
}

#[test]
fn declaration_files_written_by_the_tools_crate_load_cleanly() {
    // The generated-region format produced by shunt-tools round-trips
    // through the loader; exercised here against a hand-written file with
    // the same shape.
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        concat!(
            "name = \"b1\"\n",
            "primary_types = [\"m:float\"]\n",
            "requires_opt_in = false\n",
            "\n",
            "# BEGIN GENERATED: functions\n",
            "[functions.\"{}\"]\n",
            "function = \"b1_impl:divide\"\n",
            "# END GENERATED: functions\n",
        ),
        DIVIDE
    );
    write_decl(dir.path(), "b1", &body);

    let (system, _registrar) = BackendSystem::builder("SHUNT_T_DISCGEN")
        .source(DirSource::single(dir.path()))
        .resolver(table_with_b1())
        .build();
    let divide = default_divide(&system);
    let result = divide.call(&args(vec![float(1.0), float(2.0)])).unwrap();
    assert_eq!(called_backend(&result), "b1");
}
