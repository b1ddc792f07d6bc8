//! Worker module contract.
//!
//! A worker module is the opaque code a worker executes. It is registered by
//! name in a [`ModuleRegistry`]; the farm's `module` option selects which one
//! every worker loads. Methods are dispatched by string name.

use crate::error::ClientError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Code executed inside a worker.
pub trait WorkerModule: Send {
    /// Called once, lazily, before the first call. A failure is reported as a
    /// setup error and retried on the next call.
    fn setup(&mut self, _args: &[Value]) -> Result<(), ClientError> {
        Ok(())
    }

    /// Execute `method`. Unknown methods should return [`unknown_method`].
    fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        ctx: &mut CallContext<'_>,
    ) -> Result<Value, ClientError>;
}

/// Error returned for a method the module does not expose.
pub fn unknown_method(method: &str) -> ClientError {
    ClientError::new("TypeError", format!("{} is not a function", method))
}

/// Per-call view of the worker a method runs in.
pub struct CallContext<'a> {
    worker_id: usize,
    emit: &'a mut dyn FnMut(Value),
}

impl<'a> CallContext<'a> {
    pub fn new(worker_id: usize, emit: &'a mut dyn FnMut(Value)) -> Self {
        Self { worker_id, emit }
    }

    /// 1-based ordinal of this worker, stable across respawns.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Send an out-of-band message to the caller's listeners.
    pub fn message_parent(&mut self, payload: Value) {
        (self.emit)(payload);
    }
}

type ModuleFactory = Arc<dyn Fn() -> Box<dyn WorkerModule> + Send + Sync>;

/// Named worker modules that can be instantiated inside a worker.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory under `name`, replacing any previous one.
    pub fn register<F, M>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: WorkerModule + 'static,
    {
        self.modules
            .insert(name.into(), Arc::new(move || -> Box<dyn WorkerModule> {
                Box::new(factory())
            }));
        self
    }

    /// Instantiate the module registered under `name`.
    pub fn load(&self, name: &str) -> Option<Box<dyn WorkerModule>> {
        self.modules.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

type Method = Box<dyn Fn(Vec<Value>, &mut CallContext<'_>) -> Result<Value, ClientError> + Send>;
type Setup = Box<dyn Fn(&[Value]) -> Result<(), ClientError> + Send>;

/// A module assembled from named closures.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, Method>,
    setup: Option<Setup>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, &mut CallContext<'_>) -> Result<Value, ClientError> + Send + 'static,
    {
        self.methods.insert(name.into(), Box::new(f));
        self
    }

    pub fn on_setup<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<(), ClientError> + Send + 'static,
    {
        self.setup = Some(Box::new(f));
        self
    }
}

impl WorkerModule for MethodTable {
    fn setup(&mut self, args: &[Value]) -> Result<(), ClientError> {
        match &self.setup {
            Some(setup) => setup(args),
            None => Ok(()),
        }
    }

    fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        ctx: &mut CallContext<'_>,
    ) -> Result<Value, ClientError> {
        match self.methods.get(method) {
            Some(f) => f(args, ctx),
            None => Err(unknown_method(method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> MethodTable {
        MethodTable::new()
            .method("double", |args, _| {
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(n * 2))
            })
            .method("shout", |args, ctx| {
                ctx.message_parent(json!("shouting"));
                Ok(json!(format!("{}!", args[0].as_str().unwrap_or_default())))
            })
    }

    #[test]
    fn test_method_table_dispatch() {
        let mut module = table();
        let mut sink = |_: Value| {};
        let mut ctx = CallContext::new(1, &mut sink);
        assert_eq!(module.call("double", vec![json!(21)], &mut ctx).unwrap(), json!(42));
    }

    #[test]
    fn test_unknown_method_is_type_error() {
        let mut module = table();
        let mut sink = |_: Value| {};
        let mut ctx = CallContext::new(1, &mut sink);
        let err = module.call("missing", vec![], &mut ctx).unwrap_err();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "missing is not a function");
    }

    #[test]
    fn test_message_parent_reaches_sink() {
        let mut module = table();
        let mut seen = Vec::new();
        let mut sink = |v: Value| seen.push(v);
        let mut ctx = CallContext::new(3, &mut sink);
        assert_eq!(ctx.worker_id(), 3);
        module.call("shout", vec![json!("hey")], &mut ctx).unwrap();
        assert_eq!(seen, vec![json!("shouting")]);
    }

    #[test]
    fn test_registry_load() {
        let registry = ModuleRegistry::new().register("table", table);
        assert!(registry.contains("table"));
        assert!(registry.load("table").is_some());
        assert!(registry.load("other").is_none());
        assert_eq!(registry.names(), vec!["table"]);
    }

    #[test]
    fn test_setup_hook() {
        let mut module = MethodTable::new().on_setup(|args| {
            if args.is_empty() {
                Err(ClientError::message("missing setup args"))
            } else {
                Ok(())
            }
        });
        assert!(module.setup(&[]).is_err());
        assert!(module.setup(&[json!(1)]).is_ok());
    }
}
