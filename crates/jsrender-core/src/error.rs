use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "No JavaScript engines were registered. Register at least one engine factory with \
         `EngineRegistry::register` before creating the engine manager"
    )]
    NoEnginesRegistered,

    #[error("{}", engine_not_found_message(.message, .failures, .hint))]
    EngineNotFound {
        message: String,
        failures: Vec<CandidateFailure>,
        hint: Option<String>,
    },

    #[error("Engine pool initialisation failed: {0}")]
    EngineInitialization(Arc<Error>),

    #[error("Error while loading \"{file}\": {message}{}", position_suffix(.line, .column))]
    ScriptLoad {
        file: String,
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    #[error("{file}: {source}")]
    Transform { file: String, source: EngineError },

    #[error("{message}{}", position_suffix(.line, .column))]
    RuntimeExecution {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid component name \"{0}\"")]
    InvalidComponentName(String),

    #[error("Invalid container tag \"{0}\"")]
    InvalidContainerTag(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("The engine pool has been disposed")]
    PoolDisposed,

    #[error("The render environment has been disposed")]
    EnvironmentDisposed,

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a single engine candidate was rejected during selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub engine: String,
    pub reason: String,
}

impl Error {
    /// The sticky fault behind this error, if it came from a failed pool initialiser.
    pub fn initialization_cause(&self) -> Option<&Error> {
        match self {
            Error::EngineInitialization(cause) => Some(cause),
            _ => None,
        }
    }

    /// Report this error as a failure to load `file`, keeping the script
    /// position when the engine reported one.
    pub fn into_script_load(self, file: &str) -> Error {
        match self {
            Error::Engine(EngineError::Script(script))
            | Error::Transform {
                source: EngineError::Script(script),
                ..
            } => Error::ScriptLoad {
                file: file.to_string(),
                message: script.message,
                line: script.line,
                column: script.column,
            },
            Error::ScriptLoad { .. } => self,
            other => Error::ScriptLoad {
                file: file.to_string(),
                message: other.to_string(),
                line: None,
                column: None,
            },
        }
    }

    /// Report a script exception raised while rendering
    pub fn into_runtime_execution(self) -> Error {
        match self {
            Error::Engine(EngineError::Script(script)) => Error::RuntimeExecution {
                message: script.message,
                line: script.line,
                column: script.column,
            },
            other => other,
        }
    }
}

fn position_suffix(line: &Option<u32>, column: &Option<u32>) -> String {
    match (*line, *column) {
        (Some(line), Some(column)) => format!(" (at line {}, column {})", line, column),
        (Some(line), None) => format!(" (at line {})", line),
        _ => String::new(),
    }
}

fn engine_not_found_message(
    message: &str,
    failures: &[CandidateFailure],
    hint: &Option<String>,
) -> String {
    let mut text = message.to_string();
    for failure in failures {
        text.push_str(&format!("\n  {}: {}", failure.engine, failure.reason));
    }
    if let Some(hint) = hint {
        text.push('\n');
        text.push_str(hint);
    }
    text
}
