//! Support for building in-memory backends tersely in tests.
//!
//! A [`TestBackend`] produces a [`BackendDecl`] and registers matching
//! symbols into a [`SymbolTable`], so a test system can be assembled without
//! touching the filesystem. The default implementation of every declared
//! function returns the backend's name as a `String`, which lets tests
//! assert which backend serviced a call.

use crate::context::DispatchContext;
use crate::decl::{BackendDecl, FunctionDecl};
use crate::error::ImplError;
use crate::resolve::{ShouldRun, SymbolTable};
use crate::value::{value, CallArgs, Value};

type BoxedImpl =
    Box<dyn Fn(&DispatchContext, &CallArgs) -> Result<Value, ImplError> + Send + Sync>;
type BoxedPredicate = Box<dyn Fn(&DispatchContext, &CallArgs) -> ShouldRun + Send + Sync>;

struct TestFunction {
    id: String,
    implementation: Option<BoxedImpl>,
    should_run: Option<BoxedPredicate>,
    uses_context: bool,
}

/// Builder for one in-memory backend.
pub struct TestBackend {
    name: String,
    primary_types: Vec<String>,
    secondary_types: Vec<String>,
    requires_opt_in: bool,
    higher_priority_than: Vec<String>,
    lower_priority_than: Vec<String>,
    functions: Vec<TestFunction>,
}

impl TestBackend {
    pub fn new(name: &str) -> Self {
        TestBackend {
            name: name.to_string(),
            primary_types: Vec::new(),
            secondary_types: Vec::new(),
            requires_opt_in: false,
            higher_priority_than: Vec::new(),
            lower_priority_than: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn primary(mut self, specs: &[&str]) -> Self {
        self.primary_types = specs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn secondary(mut self, specs: &[&str]) -> Self {
        self.secondary_types = specs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn opt_in(mut self) -> Self {
        self.requires_opt_in = true;
        self
    }

    pub fn higher_priority_than(mut self, names: &[&str]) -> Self {
        self.higher_priority_than = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn lower_priority_than(mut self, names: &[&str]) -> Self {
        self.lower_priority_than = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Declares an implementation of `fn_id` that returns this backend's
    /// name as a `String`.
    pub fn implements(mut self, fn_id: &str) -> Self {
        self.functions.push(TestFunction {
            id: fn_id.to_string(),
            implementation: None,
            should_run: None,
            uses_context: false,
        });
        self
    }

    /// Declares an implementation with an explicit body.
    pub fn implements_as(
        mut self,
        fn_id: &str,
        implementation: impl Fn(&DispatchContext, &CallArgs) -> Result<Value, ImplError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.functions.push(TestFunction {
            id: fn_id.to_string(),
            implementation: Some(Box::new(implementation)),
            should_run: None,
            uses_context: false,
        });
        self
    }

    /// Attaches a `should_run` predicate to the most recently declared
    /// function.
    pub fn should_run(
        mut self,
        predicate: impl Fn(&DispatchContext, &CallArgs) -> ShouldRun + Send + Sync + 'static,
    ) -> Self {
        let function = self.functions.last_mut().expect("declare a function first");
        function.should_run = Some(Box::new(predicate));
        self
    }

    /// Marks the most recently declared function as context-using.
    pub fn uses_context(mut self) -> Self {
        let function = self.functions.last_mut().expect("declare a function first");
        function.uses_context = true;
        self
    }

    /// Registers all symbols into `table` and returns the declaration.
    pub fn register(self, table: &SymbolTable) -> BackendDecl {
        let mut decl = BackendDecl {
            name: self.name.clone(),
            primary_types: self.primary_types,
            secondary_types: self.secondary_types,
            requires_opt_in: Some(self.requires_opt_in),
            higher_priority_than: self.higher_priority_than,
            lower_priority_than: self.lower_priority_than,
            functions: Default::default(),
        };

        for function in self.functions {
            let qualname = function.id.rsplit(':').next().unwrap_or("fn").to_string();
            let impl_ident = format!("{}_impl:{}", self.name, qualname);

            match function.implementation {
                Some(body) => table.register_function(impl_ident.as_str(), body),
                None => {
                    let name = self.name.clone();
                    table.register_function(impl_ident.as_str(), move |_ctx, _args| {
                        Ok(value(name.clone()))
                    });
                }
            }

            let should_run_ident = function.should_run.map(|predicate| {
                let ident = format!("{}_impl:{}_should_run", self.name, qualname);
                table.register_should_run(ident.as_str(), predicate);
                ident
            });

            decl.functions.insert(
                function.id,
                FunctionDecl {
                    function: Some(impl_ident),
                    should_run: should_run_ident,
                    uses_context: if function.uses_context { Some(true) } else { None },
                    additional_docs: None,
                },
            );
        }

        decl
    }
}

/// Downcasts a dispatch result to the backend name returned by the default
/// test implementations.
pub fn called_backend(result: &Value) -> &str {
    result.as_any().downcast_ref::<String>().expect("test backends return their name")
}
