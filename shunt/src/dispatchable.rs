//! Registration of dispatchable functions.
//!
//! A library wraps each substitutable function once, at startup:
//!
//! ```no_run
//! # use shunt::{BackendSystem, CallArgs, value};
//! let (system, _registrar) = BackendSystem::builder("MYLIB").build();
//! let divide = system
//!     .dispatchable(
//!         "my_lib::arithmetic:divide",
//!         &["a", "b", "rounding"],
//!         &["a", "b"],
//!         |_ctx, args| {
//!             let a = args.downcast_ref::<f64>(0).ok_or("a must be f64")?;
//!             let b = args.downcast_ref::<f64>(1).ok_or("b must be f64")?;
//!             Ok(value(a / b))
//!         },
//!     )
//!     .unwrap();
//!
//! let out = divide.call(&CallArgs::new(vec![value(1.0f64), value(2.0f64)]));
//! ```
//!
//! Dispatched parameters are declared by name; the names are resolved to
//! positions here, once, against the function's parameter list.

use std::sync::Arc;

use crate::cache::Plan;
use crate::context::DispatchContext;
use crate::engine::{BackendSystem, DispatchTarget};
use crate::error::{ConfigError, DispatchError, ImplError};
use crate::ident::TypeKey;
use crate::registry::FunctionBinding;
use crate::value::{CallArgs, Value};

impl BackendSystem {
    /// Wraps a default implementation as a dispatchable function.
    ///
    /// - `id` is the library-qualified name (`"module:qualname"`) backends
    ///   bind to in their declaration files.
    /// - `params` is the function's full parameter list, in order.
    /// - `dispatch_on` names the parameters whose argument types drive
    ///   dispatch; it must be a non-empty subset of `params`.
    pub fn dispatchable(
        self: &Arc<Self>,
        id: &str,
        params: &[&str],
        dispatch_on: &[&str],
        default_impl: impl Fn(&DispatchContext, &CallArgs) -> Result<Value, ImplError>
            + Send
            + Sync
            + 'static,
    ) -> Result<DispatchFn, ConfigError> {
        TypeKey::parse(id).map_err(|_| ConfigError::Dispatchable {
            function: id.to_string(),
            message: "id must have the form \"module:qualname\"".to_string(),
        })?;
        if dispatch_on.is_empty() {
            return Err(ConfigError::Dispatchable {
                function: id.to_string(),
                message: "at least one dispatched parameter is required".to_string(),
            });
        }

        let mut positions = Vec::with_capacity(dispatch_on.len());
        for name in dispatch_on {
            let Some(position) = params.iter().position(|p| p == name) else {
                return Err(ConfigError::Dispatchable {
                    function: id.to_string(),
                    message: format!("dispatched parameter {name:?} is not in the parameter list"),
                });
            };
            positions.push(position);
        }
        positions.sort_unstable();
        positions.dedup();

        let id: Arc<str> = Arc::from(id);
        let default_binding = Arc::new(FunctionBinding::direct(
            Arc::from(crate::registry::DEFAULT_BACKEND),
            Arc::new(default_impl),
        ));

        Ok(DispatchFn {
            system: Arc::clone(self),
            target: DispatchTarget { id, positions, default_binding },
            params: params.iter().map(|s| s.to_string()).collect(),
            dispatch_names: dispatch_on.iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// A registered dispatchable function.
///
/// Calling it enters the dispatch engine; the engine otherwise treats the
/// object as opaque. Metadata accessors exist for introspection.
pub struct DispatchFn {
    system: Arc<BackendSystem>,
    target: DispatchTarget,
    params: Vec<String>,
    dispatch_names: Vec<String>,
}

impl DispatchFn {
    /// Dispatches one call.
    pub fn call(&self, args: &CallArgs) -> Result<Value, DispatchError> {
        self.system.dispatch(&self.target, args)
    }

    /// The candidate plan the engine would try for these arguments, without
    /// calling any backend.
    pub fn preview(&self, args: &CallArgs) -> Arc<Plan> {
        self.system.plan_for(&self.target, args)
    }

    /// The library-qualified function id.
    pub fn id(&self) -> &str {
        &self.target.id
    }

    /// The full parameter list.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Names of the dispatched parameters.
    pub fn dispatched_params(&self) -> &[String] {
        &self.dispatch_names
    }

    /// Each backend's `additional_docs` blurb for this function, in base
    /// priority order.
    pub fn backend_docs(&self) -> Vec<(String, Option<String>)> {
        self.system
            .docs_for(&self.target.id)
            .into_iter()
            .map(|(name, docs)| (name.to_string(), docs))
            .collect()
    }
}

impl std::fmt::Debug for DispatchFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchFn")
            .field("id", &self.target.id)
            .field("dispatched_params", &self.dispatch_names)
            .finish()
    }
}
