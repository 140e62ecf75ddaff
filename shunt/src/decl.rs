//! Backend declaration files.
//!
//! A backend ships a small TOML file next to its installed code declaring
//! its name, the types it accepts, priority hints, and the dispatchable
//! functions it implements:
//!
//! ```toml
//! name = "cuviper"
//! primary_types = ["cuviper::arrays:DeviceArray"]
//! secondary_types = ["~my_lib::arrays:HostArray"]
//! requires_opt_in = false
//! higher_priority_than = ["other-backend"]
//!
//! [functions.defaults]
//! uses_context = false
//!
//! [functions."my_lib::filters:gaussian"]
//! function = "cuviper::filters:gaussian"
//! should_run = "cuviper::filters:gaussian_should_run"
//! additional_docs = "Runs on the GPU for device arrays."
//! ```
//!
//! The reserved `functions.defaults` entry supplies field values applied
//! wherever a function entry omits them. Parsing and re-serializing a file
//! preserves its logical content.
//!
//! The engine only ever reads these files; backend packages maintain them
//! with the offline tooling in `shunt-tools`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ident::{TypeKey, TypeSpec};

/// Reserved key in the `functions` table holding fallback field values.
pub const DEFAULTS_KEY: &str = "defaults";

/// Parsed declaration of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDecl {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_types: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_types: Vec<String>,

    /// Defaults to `true` when `primary_types` is non-empty, else `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_opt_in: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub higher_priority_than: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lower_priority_than: Vec<String>,

    /// Library function id (`"lib::module:qualname"`) to implementation
    /// entry. May contain the reserved [`DEFAULTS_KEY`] entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub functions: BTreeMap<String, FunctionDecl>,
}

/// One function entry of a declaration; every field may be omitted and
/// filled from `functions.defaults`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_run: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses_context: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_docs: Option<String>,
}

/// A function entry after defaults application: the fields the registry
/// actually stores.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFunction {
    pub function: String,
    pub should_run: Option<String>,
    pub uses_context: bool,
    pub additional_docs: Option<String>,
}

impl BackendDecl {
    /// Parses a declaration from TOML text.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Serializes back to TOML. Round-trips the logical content of
    /// [`parse`](Self::parse).
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("declaration serializes")
    }

    /// Effective opt-in flag per the declaration-file defaulting rule.
    pub fn effective_opt_in(&self) -> bool {
        self.requires_opt_in.unwrap_or(!self.primary_types.is_empty())
    }

    /// Parsed primary type specs.
    pub fn primary_specs(&self) -> Result<Vec<TypeSpec>, ConfigError> {
        self.primary_types.iter().map(|s| s.parse()).collect()
    }

    /// Parsed secondary type specs.
    pub fn secondary_specs(&self) -> Result<Vec<TypeSpec>, ConfigError> {
        self.secondary_types.iter().map(|s| s.parse()).collect()
    }

    /// Function entries with `functions.defaults` applied, the reserved
    /// entry itself excluded.
    pub fn resolved_functions(
        &self,
    ) -> Result<BTreeMap<String, ResolvedFunction>, ConfigError> {
        let defaults = self.functions.get(DEFAULTS_KEY).cloned().unwrap_or_default();
        let mut out = BTreeMap::new();
        for (id, entry) in &self.functions {
            if id == DEFAULTS_KEY {
                continue;
            }
            let function = entry
                .function
                .clone()
                .or_else(|| defaults.function.clone())
                .ok_or(ConfigError::MissingField { backend: self.name.clone(), field: "function" })?;
            out.insert(
                id.clone(),
                ResolvedFunction {
                    function,
                    should_run: entry.should_run.clone().or_else(|| defaults.should_run.clone()),
                    uses_context: entry
                        .uses_context
                        .or(defaults.uses_context)
                        .unwrap_or(false),
                    additional_docs: entry
                        .additional_docs
                        .clone()
                        .or_else(|| defaults.additional_docs.clone()),
                },
            );
        }
        Ok(out)
    }

    /// Validates the declaration against an entry-point name.
    ///
    /// Checks the backend name, every type spec, the shape of every function
    /// id and implementation locator. Symbol resolution itself is deferred to
    /// first use.
    pub fn validate(&self, entry_name: Option<&str>) -> Result<(), ConfigError> {
        if !valid_backend_name(&self.name) {
            return Err(ConfigError::BackendName { name: self.name.clone() });
        }
        if let Some(entry) = entry_name {
            if entry != self.name {
                return Err(ConfigError::NameMismatch {
                    entry: entry.to_string(),
                    declared: self.name.clone(),
                });
            }
        }

        self.primary_specs()?;
        self.secondary_specs()?;

        for (id, resolved) in self.resolved_functions()? {
            TypeKey::parse(&id)?;
            TypeKey::parse(&resolved.function)?;
            if let Some(sr) = &resolved.should_run {
                TypeKey::parse(sr)?;
            }
        }
        Ok(())
    }
}

/// Backend names follow entry-point conventions: letters, digits, `_`, `-`
/// and `.`.
pub fn valid_backend_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
