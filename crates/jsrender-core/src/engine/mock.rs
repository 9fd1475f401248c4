//! In-process engine used by tests.
//!
//! `MockEngine` does not interpret JavaScript. It records what it is asked to
//! run, answers `evaluate` from a table of known expressions and dispatches
//! `call_function` to native Rust closures. A script that throws a string
//! literal (`throw 'message';`) fails with a [`ScriptError`] pointing at
//! that line. Other `throw` statements are ignored.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Engine, EngineError, EngineFactory, PrecompiledScript, ScriptError};

/// A native function callable from `Engine::call_function`
pub type NativeFunction = Arc<dyn Fn(&[Value]) -> Result<Value, EngineError> + Send + Sync>;

#[derive(Default)]
struct Shared {
    created: AtomicUsize,
    disposed: AtomicUsize,
    precompiled: AtomicUsize,
    create_error: Mutex<Option<String>>,
    expressions: Mutex<FxHashMap<String, Value>>,
    functions: Mutex<FxHashMap<String, NativeFunction>>,
    executed: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory for [`MockEngine`]s. Clones share configuration and counters.
#[derive(Clone)]
pub struct MockEngineFactory {
    name: String,
    version: String,
    precompilation: bool,
    transformation: bool,
    hint: Option<String>,
    shared: Arc<Shared>,
}

impl MockEngineFactory {
    pub fn new(name: impl Into<String>) -> Self {
        let factory = Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            precompilation: false,
            transformation: true,
            hint: None,
            shared: Arc::new(Shared::default()),
        };
        factory.with_expression("1 + 1", Value::from(2))
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_precompilation(mut self) -> Self {
        self.precompilation = true;
        self
    }

    pub fn without_transformation(mut self) -> Self {
        self.transformation = false;
        self
    }

    /// Hint returned by `diagnose` for every creation failure
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Make every `create` call fail with `message`
    pub fn failing_create(self, message: impl Into<String>) -> Self {
        self.set_create_error(Some(message.into()));
        self
    }

    /// Make the default selection probe fail
    pub fn failing_probe(self) -> Self {
        self.with_expression("1 + 1", Value::from(3))
    }

    pub fn with_expression(self, expression: impl Into<String>, value: Value) -> Self {
        lock(&self.shared.expressions).insert(expression.into(), value);
        self
    }

    pub fn with_function<F>(self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        self.set_function(name, function);
        self
    }

    /// Register or replace a native function after engines were created
    pub fn set_function<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        lock(&self.shared.functions).insert(name.into(), Arc::new(function));
    }

    pub fn set_create_error(&self, message: Option<String>) {
        *lock(&self.shared.create_error) = message;
    }

    /// Engines created so far
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Engines disposed so far
    pub fn disposed(&self) -> usize {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Engines created and not yet disposed
    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.disposed())
    }

    pub fn precompiled(&self) -> usize {
        self.shared.precompiled.load(Ordering::SeqCst)
    }

    /// Documents executed by any engine of this factory, in order
    pub fn executed_documents(&self) -> Vec<String> {
        lock(&self.shared.executed).clone()
    }

    /// How many times `document` was executed
    pub fn execution_count(&self, document: &str) -> usize {
        lock(&self.shared.executed)
            .iter()
            .filter(|d| d.as_str() == document)
            .count()
    }

    /// Names of the functions called through `call_function`, in order
    pub fn function_calls(&self) -> Vec<String> {
        lock(&self.shared.calls).clone()
    }

    pub fn clear_history(&self) {
        lock(&self.shared.executed).clear();
        lock(&self.shared.calls).clear();
    }
}

impl EngineFactory for MockEngineFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self) -> Result<Box<dyn Engine>, EngineError> {
        if let Some(message) = lock(&self.shared.create_error).clone() {
            return Err(EngineError::Backend(message));
        }
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            name: self.name.clone(),
            version: self.version.clone(),
            precompilation: self.precompilation,
            transformation: self.transformation,
            globals: FxHashMap::default(),
            disposed: false,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn diagnose(&self, _error: &EngineError) -> Option<String> {
        self.hint.clone()
    }
}

/// See the module documentation
pub struct MockEngine {
    name: String,
    version: String,
    precompilation: bool,
    transformation: bool,
    globals: FxHashMap<String, Value>,
    disposed: bool,
    shared: Arc<Shared>,
}

impl MockEngine {
    fn check_disposed(&self) -> Result<(), EngineError> {
        if self.disposed {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }
}

fn thrown_error(code: &str, document: &str) -> Option<ScriptError> {
    code.lines().enumerate().find_map(|(index, line)| {
        let column = line.find("throw '").or_else(|| line.find("throw \""))?;
        let message = line[column + "throw ".len()..]
            .trim()
            .trim_end_matches(';')
            .trim_matches(|c| c == '\'' || c == '"')
            .to_string();
        Some(
            ScriptError::new(message)
                .in_document(document)
                .at(index as u32 + 1, column as u32 + 1),
        )
    })
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn supports_precompilation(&self) -> bool {
        self.precompilation
    }

    fn supports_transformation(&self) -> bool {
        self.transformation
    }

    fn execute(&mut self, code: &str, document: &str) -> Result<(), EngineError> {
        self.check_disposed()?;
        lock(&self.shared.executed).push(document.to_string());
        match thrown_error(code, document) {
            Some(error) => Err(EngineError::Script(error)),
            None => Ok(()),
        }
    }

    fn evaluate(&mut self, code: &str) -> Result<Value, EngineError> {
        self.check_disposed()?;
        let code = code.trim();
        if let Some(value) = self.globals.get(code) {
            return Ok(value.clone());
        }
        lock(&self.shared.expressions)
            .get(code)
            .cloned()
            .ok_or_else(|| {
                EngineError::Script(ScriptError::new(format!(
                    "ReferenceError: {} is not defined",
                    code
                )))
            })
    }

    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, EngineError> {
        self.check_disposed()?;
        lock(&self.shared.calls).push(name.to_string());
        let function = lock(&self.shared.functions).get(name).cloned();
        match function {
            Some(function) => function(args),
            None => Err(EngineError::Script(ScriptError::new(format!(
                "TypeError: {} is not a function",
                name
            )))),
        }
    }

    fn has_variable(&mut self, name: &str) -> Result<bool, EngineError> {
        self.check_disposed()?;
        Ok(self.globals.contains_key(name) || lock(&self.shared.functions).contains_key(name))
    }

    fn set_variable(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        self.check_disposed()?;
        self.globals.insert(name.to_string(), value);
        Ok(())
    }

    fn precompile(&mut self, code: &str, document: &str) -> Result<PrecompiledScript, EngineError> {
        self.check_disposed()?;
        if !self.precompilation {
            return Err(EngineError::Unsupported("Precompilation".to_string()));
        }
        self.shared.precompiled.fetch_add(1, Ordering::SeqCst);
        Ok(PrecompiledScript {
            engine: self.name.clone(),
            document: document.to_string(),
            data: Arc::new(code.to_string()),
        })
    }

    fn execute_precompiled(&mut self, script: &PrecompiledScript) -> Result<(), EngineError> {
        let code = script
            .data
            .downcast_ref::<String>()
            .cloned()
            .ok_or_else(|| EngineError::Backend("Foreign precompiled script".to_string()))?;
        self.execute(&code, &script.document)
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.shared.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_creation_and_disposal() {
        let factory = MockEngineFactory::new("mock");
        let mut engine = factory.create().unwrap();
        assert_eq!(factory.live(), 1);

        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        assert_eq!(factory.disposed(), 1);
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn test_drop_disposes() {
        let factory = MockEngineFactory::new("mock");
        drop(factory.create().unwrap());
        assert_eq!(factory.disposed(), 1);
    }

    #[test]
    fn test_throw_reports_position() {
        let factory = MockEngineFactory::new("mock");
        let mut engine = factory.create().unwrap();
        let err = engine
            .execute("var a = 1;\n  throw 'broken';", "lib.js")
            .unwrap_err();
        let script = err.script_error().unwrap();
        assert_eq!(script.message, "broken");
        assert_eq!(script.document.as_deref(), Some("lib.js"));
        assert_eq!((script.line, script.column), (Some(2), Some(3)));
    }

    #[test]
    fn test_probe_expression() {
        let mut engine = MockEngineFactory::new("mock").create().unwrap();
        assert_eq!(engine.evaluate("1 + 1").unwrap(), Value::from(2));

        let mut broken = MockEngineFactory::new("mock").failing_probe().create().unwrap();
        assert_ne!(broken.evaluate("1 + 1").unwrap(), Value::from(2));
    }

    #[test]
    fn test_native_functions_and_globals() {
        let factory = MockEngineFactory::new("mock")
            .with_function("add", |args| {
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(Value::from(sum))
            });
        let mut engine = factory.create().unwrap();

        assert_eq!(
            engine
                .call_function("add", &[Value::from(2), Value::from(3)])
                .unwrap(),
            Value::from(5)
        );
        assert!(engine.call_function("missing", &[]).is_err());

        assert!(!engine.has_variable("flag").unwrap());
        engine.set_variable("flag", Value::Bool(true)).unwrap();
        assert!(engine.has_variable("flag").unwrap());
        assert!(engine.has_variable("add").unwrap());
        assert_eq!(factory.function_calls(), vec!["add", "missing"]);
    }

    #[test]
    fn test_disposed_engine_rejects_work() {
        let mut engine = MockEngineFactory::new("mock").create().unwrap();
        engine.dispose();
        assert!(matches!(
            engine.execute("1", "a.js"),
            Err(EngineError::Disposed)
        ));
    }

    #[test]
    fn test_precompilation_roundtrip() {
        let factory = MockEngineFactory::new("mock").with_precompilation();
        let mut engine = factory.create().unwrap();
        let script = engine.precompile("var x = 1;", "x.js").unwrap();
        engine.execute_precompiled(&script).unwrap();
        assert_eq!(factory.precompiled(), 1);
        assert_eq!(factory.executed_documents(), vec!["x.js"]);

        let mut plain = MockEngineFactory::new("plain").create().unwrap();
        assert!(matches!(
            plain.precompile("1", "a.js"),
            Err(EngineError::Unsupported(_))
        ));
    }
}
