//! Entry-point enumeration and lazy declaration loading.
//!
//! Installed backends announce themselves through an *entry-point source*: a
//! listing of `(name, locator)` pairs under a group name the integrating
//! library chooses. The locator points at the backend's declaration file,
//! which is only read and parsed on first need.
//!
//! Failures are isolated per backend: a missing or malformed declaration
//! marks that backend broken and the rest keep loading.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::decl::BackendDecl;
use crate::error::ConfigError;

/// One installed backend declaration, discovered but not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    pub locator: PathBuf,
}

/// Enumerates installed backend declarations for one group.
pub trait EntryPointSource: Send + Sync {
    fn list(&self) -> Vec<EntryPoint>;
}

/// Filesystem source: every `<name>.toml` directly inside one of the root
/// directories is an entry point named after its file stem.
#[derive(Debug, Clone)]
pub struct DirSource {
    roots: Vec<PathBuf>,
}

impl DirSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        DirSource { roots }
    }

    pub fn single(root: impl Into<PathBuf>) -> Self {
        DirSource { roots: vec![root.into()] }
    }
}

impl EntryPointSource for DirSource {
    fn list(&self) -> Vec<EntryPoint> {
        let mut entries = Vec::new();
        for root in &self.roots {
            let Ok(dir) = fs::read_dir(root) else {
                debug!(root = %root.display(), "entry-point root not readable, skipping");
                continue;
            };
            for file in dir.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                entries.push(EntryPoint { name: stem.to_string(), locator: path });
            }
        }
        // Stable enumeration order regardless of filesystem order.
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// Static source for explicitly registered declarations, mainly for tests
/// and libraries bundling internal backends.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    entries: Vec<EntryPoint>,
}

impl StaticSource {
    pub fn new(entries: Vec<EntryPoint>) -> Self {
        StaticSource { entries }
    }
}

impl EntryPointSource for StaticSource {
    fn list(&self) -> Vec<EntryPoint> {
        self.entries.clone()
    }
}

/// Discovers entry points across sources and loads declarations lazily.
pub struct Loader {
    sources: Vec<Box<dyn EntryPointSource>>,
    blocked: BTreeSet<String>,
    parsed: Mutex<HashMap<PathBuf, Arc<BackendDecl>>>,
}

impl Loader {
    /// `blocked` comes from the `<PREFIX>_BLOCK` environment variable;
    /// blocked backends are reported as absent and their files never read.
    pub fn new(sources: Vec<Box<dyn EntryPointSource>>, blocked: BTreeSet<String>) -> Self {
        Loader { sources, blocked, parsed: Mutex::new(HashMap::new()) }
    }

    /// Enumerates entry points across all sources.
    ///
    /// Names must be unique: a later duplicate is rejected with a warning.
    /// Blocked names are dropped silently.
    pub fn list(&self) -> Vec<EntryPoint> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut out = Vec::new();
        for source in &self.sources {
            for entry in source.list() {
                if self.blocked.contains(&entry.name) {
                    debug!(backend = %entry.name, "blocked by environment, skipping");
                    continue;
                }
                if !seen.insert(entry.name.clone()) {
                    warn!(
                        backend = %entry.name,
                        locator = %entry.locator.display(),
                        "duplicate entry-point name, rejecting the later one"
                    );
                    continue;
                }
                out.push(entry);
            }
        }
        out
    }

    /// Parses and validates the declaration behind one entry point,
    /// memoizing the result.
    pub fn load(&self, entry: &EntryPoint) -> Result<Arc<BackendDecl>, ConfigError> {
        if let Some(decl) = self.parsed.lock().expect("loader poisoned").get(&entry.locator) {
            return Ok(Arc::clone(decl));
        }

        let decl = Arc::new(read_declaration(&entry.locator, Some(&entry.name))?);
        self.parsed
            .lock()
            .expect("loader poisoned")
            .insert(entry.locator.clone(), Arc::clone(&decl));
        Ok(decl)
    }
}

/// Reads, parses, and validates one declaration file.
pub fn read_declaration(path: &Path, entry_name: Option<&str>) -> Result<BackendDecl, ConfigError> {
    let text = fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let decl = BackendDecl::parse(&text)
        .map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })?;
    decl.validate(entry_name)?;
    Ok(decl)
}
