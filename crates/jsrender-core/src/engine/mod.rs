//! JavaScript engine abstraction
//!
//! Backends implement [`Engine`] and register an [`EngineFactory`]. The rest
//! of the crate only ever talks to `dyn Engine`; backend differences are
//! exposed as capability flags.

mod manager;
pub mod mock;
mod pool;
mod selector;
mod thread_local;

pub use manager::{EngineLease, EngineManager, LARGE_STACK_THREAD_NAME};
pub use pool::{EnginePool, Initializer, PoolConfig, PoolStats, PooledEngine};
pub use selector::{EngineRegistry, EngineSelector, Probe};
pub use thread_local::{SharedEngine, ThreadLocalEngines};

use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by an engine backend
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("{0}")]
    Script(ScriptError),

    #[error("The engine has been disposed")]
    Disposed,

    #[error("{0} is not supported by this engine")]
    Unsupported(String),

    #[error("{0}")]
    Backend(String),
}

/// A JavaScript exception raised while running a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub message: String,
    pub document: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            document: None,
            line: None,
            column: None,
        }
    }

    pub fn in_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        match (&self.document, self.line, self.column) {
            (Some(document), Some(line), Some(column)) => {
                write!(f, " ({}:{}:{})", document, line, column)
            }
            (None, Some(line), Some(column)) => write!(f, " ({}:{})", line, column),
            _ => Ok(()),
        }
    }
}

impl EngineError {
    /// The script exception behind this error, if there is one
    pub fn script_error(&self) -> Option<&ScriptError> {
        match self {
            EngineError::Script(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ScriptError> for EngineError {
    fn from(error: ScriptError) -> Self {
        EngineError::Script(error)
    }
}

/// A script compiled ahead of time by an engine that supports it.
///
/// The payload is backend specific; only the engine that produced it can
/// execute it.
#[derive(Clone)]
pub struct PrecompiledScript {
    pub engine: String,
    pub document: String,
    pub data: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for PrecompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrecompiledScript")
            .field("engine", &self.engine)
            .field("document", &self.document)
            .finish_non_exhaustive()
    }
}

/// A running JavaScript engine instance.
///
/// Engines are owned by one caller at a time, so they must be `Send` but are
/// never shared without a lock.
pub trait Engine: Send {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn supports_precompilation(&self) -> bool {
        false
    }

    /// Whether the engine can host the transpiler
    fn supports_transformation(&self) -> bool {
        true
    }

    /// Run a script for its side effects
    fn execute(&mut self, code: &str, document: &str) -> Result<(), EngineError>;

    /// Evaluate an expression and return its JSON value
    fn evaluate(&mut self, code: &str) -> Result<Value, EngineError>;

    /// Call a global function with JSON arguments
    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, EngineError>;

    fn has_variable(&mut self, name: &str) -> Result<bool, EngineError>;

    fn set_variable(&mut self, name: &str, value: Value) -> Result<(), EngineError>;

    fn precompile(&mut self, _code: &str, _document: &str) -> Result<PrecompiledScript, EngineError> {
        Err(EngineError::Unsupported("Precompilation".to_string()))
    }

    fn execute_precompiled(&mut self, _script: &PrecompiledScript) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("Precompilation".to_string()))
    }

    /// Release the underlying runtime. Calling it twice is harmless.
    fn dispose(&mut self);

    fn is_disposed(&self) -> bool;
}

/// Creates engines of one backend
pub trait EngineFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> Result<Box<dyn Engine>, EngineError>;

    /// A hint for the user when `error` indicates a platform problem
    /// (missing native library, unsupported architecture, ...)
    fn diagnose(&self, _error: &EngineError) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display() {
        let error = ScriptError::new("ReferenceError: x is not defined")
            .in_document("app.js")
            .at(3, 7);
        assert_eq!(
            error.to_string(),
            "ReferenceError: x is not defined (app.js:3:7)"
        );
        assert_eq!(ScriptError::new("boom").to_string(), "boom");
    }

    #[test]
    fn test_engine_error_script_accessor() {
        let error = EngineError::from(ScriptError::new("boom"));
        assert_eq!(error.script_error().map(|e| e.message.as_str()), Some("boom"));
        assert!(EngineError::Disposed.script_error().is_none());
    }

    #[test]
    fn test_precompiled_script_debug_hides_payload() {
        let script = PrecompiledScript {
            engine: "mock".to_string(),
            document: "a.js".to_string(),
            data: Arc::new(42u32),
        };
        let debug = format!("{:?}", script);
        assert!(debug.contains("a.js"));
        assert!(!debug.contains("42"));
    }
}
