//! [Boa](https://boajs.dev) backend for jsrender.
//!
//! ```ignore
//! let mut registry = EngineRegistry::new();
//! registry.register(BoaEngineFactory::new());
//! ```

mod conversions;
mod worker;

use crossbeam_channel::Sender;
use jsrender_core::engine::LARGE_STACK_THREAD_NAME;
use jsrender_core::{Engine, EngineError, EngineFactory};
use serde_json::Value;
use std::thread::JoinHandle;
use tracing::debug;

use worker::{Command, Reply};

pub const ENGINE_NAME: &str = "boa";

const BOA_VERSION: &str = "0.20";

/// Stack of an engine thread created from an ordinary thread
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Stack of an engine thread created while retrying on the large-stack thread
pub const DEFAULT_LARGE_STACK_SIZE: usize = 16 * 1024 * 1024;

const STACK_BYTES_PER_RECURSION: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct BoaEngineFactory {
    stack_size: usize,
    large_stack_size: usize,
}

impl Default for BoaEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BoaEngineFactory {
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            large_stack_size: DEFAULT_LARGE_STACK_SIZE,
        }
    }

    pub fn with_stack_sizes(mut self, stack_size: usize, large_stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self.large_stack_size = large_stack_size.max(stack_size);
        self
    }

    /// Engines created on the large-stack retry thread get the large stack,
    /// and a recursion limit to match
    fn stack_size_for_current_thread(&self) -> usize {
        if std::thread::current().name() == Some(LARGE_STACK_THREAD_NAME) {
            self.large_stack_size
        } else {
            self.stack_size
        }
    }
}

impl EngineFactory for BoaEngineFactory {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn create(&self) -> Result<Box<dyn Engine>, EngineError> {
        let stack_size = self.stack_size_for_current_thread();
        let recursion_limit = stack_size / STACK_BYTES_PER_RECURSION;
        let (commands, receiver) = crossbeam_channel::unbounded();

        let thread = std::thread::Builder::new()
            .name("jsrender-boa".to_string())
            .stack_size(stack_size)
            .spawn(move || worker::run(receiver, recursion_limit))
            .map_err(|e| EngineError::Backend(format!("Could not start engine thread: {}", e)))?;

        debug!(
            "Created Boa engine ({} byte stack, recursion limit {})",
            stack_size, recursion_limit
        );
        Ok(Box::new(BoaEngine {
            commands: Some(commands),
            thread: Some(thread),
        }))
    }
}

/// A Boa context running on its own thread
pub struct BoaEngine {
    commands: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl BoaEngine {
    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let commands = self.commands.as_ref().ok_or(EngineError::Disposed)?;
        let (reply, response) = crossbeam_channel::bounded(1);
        commands.send(command(reply)).map_err(|_| engine_thread_gone())?;
        response.recv().map_err(|_| engine_thread_gone())?
    }
}

fn engine_thread_gone() -> EngineError {
    EngineError::Backend("The Boa engine thread has stopped".to_string())
}

impl Engine for BoaEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn version(&self) -> &str {
        BOA_VERSION
    }

    fn execute(&mut self, code: &str, document: &str) -> Result<(), EngineError> {
        self.request(|reply| Command::Execute {
            code: code.to_string(),
            document: document.to_string(),
            reply,
        })
    }

    fn evaluate(&mut self, code: &str) -> Result<Value, EngineError> {
        self.request(|reply| Command::Evaluate {
            code: code.to_string(),
            reply,
        })
    }

    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, EngineError> {
        self.request(|reply| Command::Call {
            function: name.to_string(),
            args: args.to_vec(),
            reply,
        })
    }

    fn has_variable(&mut self, name: &str) -> Result<bool, EngineError> {
        self.request(|reply| Command::HasVariable {
            name: name.to_string(),
            reply,
        })
    }

    fn set_variable(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        self.request(|reply| Command::SetVariable {
            name: name.to_string(),
            value,
            reply,
        })
    }

    fn dispose(&mut self) {
        // Closing the channel stops the thread once the current command is done
        self.commands = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!("Boa engine thread panicked");
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.commands.is_none()
    }
}

impl Drop for BoaEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
