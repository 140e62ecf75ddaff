//! Backend-author helpers for shunt.
//!
//! A backend package keeps a local [`ImplRegistry`] of the dispatchable
//! functions it implements, and an offline step rewrites the generated
//! region of its declaration file from that registry:
//!
//! ```no_run
//! use shunt_tools::{update_declaration, ImplRegistry};
//!
//! let mut registry = ImplRegistry::new("cuviper").unwrap();
//! registry
//!     .implements("my_lib::filters:gaussian", "cuviper::filters:gaussian")
//!     .unwrap()
//!     .should_run("cuviper::filters:gaussian_should_run")
//!     .docs("Runs on the GPU for device arrays.");
//! update_declaration("decl/cuviper.toml", &registry).unwrap();
//! ```
//!
//! Only the region between the `# BEGIN GENERATED: functions` and
//! `# END GENERATED: functions` markers is rewritten; the hand-written rest
//! of the file (name, types, priority hints) is preserved byte for byte.
//! The rewrite is idempotent and sorted by function id. The engine itself
//! never uses this crate; it reads the declaration file alone.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use shunt::{BackendDecl, TypeKey};

/// Marker opening the generated region of a declaration file.
pub const BEGIN_MARKER: &str = "# BEGIN GENERATED: functions";
/// Marker closing the generated region of a declaration file.
pub const END_MARKER: &str = "# END GENERATED: functions";

/// Problems while recording implementations or rewriting a declaration.
#[derive(Debug, Error)]
pub enum ToolsError {
    #[error("invalid backend name {0:?}")]
    BackendName(String),

    #[error("invalid identifier {0:?}, expected \"module:qualname\"")]
    Identifier(String),

    #[error("declaration file {path:?} has no {marker:?} marker")]
    MissingMarker { path: std::path::PathBuf, marker: &'static str },

    #[error("cannot access declaration file {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rewritten declaration does not parse: {0}")]
    Reparse(String),
}

/// One recorded implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    function: String,
    should_run: Option<String>,
    uses_context: bool,
    docs: Option<String>,
}

impl FunctionInfo {
    /// Attaches a `should_run` predicate identifier.
    pub fn should_run(&mut self, ident: &str) -> &mut Self {
        self.should_run = Some(ident.to_string());
        self
    }

    /// Marks the implementation as taking a `DispatchContext` first.
    pub fn uses_context(&mut self) -> &mut Self {
        self.uses_context = true;
        self
    }

    /// Documentation blurb surfaced to library users.
    pub fn docs(&mut self, text: &str) -> &mut Self {
        self.docs = Some(text.to_string());
        self
    }
}

/// A backend package's local record of what it implements.
#[derive(Debug)]
pub struct ImplRegistry {
    name: String,
    functions: BTreeMap<String, FunctionInfo>,
}

impl ImplRegistry {
    pub fn new(backend_name: &str) -> Result<Self, ToolsError> {
        if !shunt::decl::valid_backend_name(backend_name) {
            return Err(ToolsError::BackendName(backend_name.to_string()));
        }
        Ok(ImplRegistry { name: backend_name.to_string(), functions: BTreeMap::new() })
    }

    pub fn backend_name(&self) -> &str {
        &self.name
    }

    /// Records an implementation of a library function. Returns the entry
    /// for attaching `should_run`, context use, and docs.
    ///
    /// Identifiers are validated for shape here, at record time; whether
    /// they resolve is only known at runtime, by the engine.
    pub fn implements(
        &mut self,
        api_id: &str,
        impl_ident: &str,
    ) -> Result<&mut FunctionInfo, ToolsError> {
        for ident in [api_id, impl_ident] {
            if TypeKey::parse(ident).is_err() {
                return Err(ToolsError::Identifier(ident.to_string()));
            }
        }
        Ok(self.functions.entry(api_id.to_string()).or_insert_with(|| FunctionInfo {
            function: impl_ident.to_string(),
            should_run: None,
            uses_context: false,
            docs: None,
        }))
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (api_id, info) in &self.functions {
            out.push_str(&format!("[functions.{}]\n", toml_key(api_id)));
            out.push_str(&format!("function = {}\n", toml_string(&info.function)));
            if let Some(should_run) = &info.should_run {
                out.push_str(&format!("should_run = {}\n", toml_string(should_run)));
            }
            if info.uses_context {
                out.push_str("uses_context = true\n");
            }
            if let Some(docs) = &info.docs {
                out.push_str(&format!("additional_docs = {}\n", toml_string(docs)));
            }
            out.push('\n');
        }
        // No trailing blank line before the end marker.
        while out.ends_with('\n') {
            out.pop();
        }
        out
    }
}

fn toml_key(key: &str) -> String {
    format!("\"{}\"", key.escape_default())
}

fn toml_string(text: &str) -> String {
    format!("\"{}\"", text.escape_default())
}

/// Rewrites the generated `functions` region of a declaration file from a
/// registry, preserving everything outside the markers.
pub fn update_declaration(
    path: impl AsRef<Path>,
    registry: &ImplRegistry,
) -> Result<(), ToolsError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|source| ToolsError::Io { path: path.to_path_buf(), source })?;

    let updated = splice(&text, &registry.render(), path)?;

    // Guard against a marker region that breaks the file's syntax.
    BackendDecl::parse(&updated).map_err(|e| ToolsError::Reparse(e.to_string()))?;

    std::fs::write(path, &updated)
        .map_err(|source| ToolsError::Io { path: path.to_path_buf(), source })?;
    info!(
        backend = %registry.name,
        path = %path.display(),
        functions = registry.functions.len(),
        "declaration file updated"
    );
    Ok(())
}

fn splice(text: &str, generated: &str, path: &Path) -> Result<String, ToolsError> {
    let begin = text.find(BEGIN_MARKER).ok_or(ToolsError::MissingMarker {
        path: path.to_path_buf(),
        marker: BEGIN_MARKER,
    })?;
    let end = text.find(END_MARKER).ok_or(ToolsError::MissingMarker {
        path: path.to_path_buf(),
        marker: END_MARKER,
    })?;

    let after_begin = begin + BEGIN_MARKER.len();
    let body = if generated.is_empty() {
        String::from("\n")
    } else {
        format!("\n{generated}\n")
    };
    Ok(format!("{}{}{}", &text[..after_begin], body, &text[end..]))
}
