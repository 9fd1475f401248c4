use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Engine, EngineError, EngineFactory};
use crate::error::{CandidateFailure, Error, Result};

/// A check run against a trial engine during selection
pub type Probe = dyn Fn(&mut dyn Engine) -> std::result::Result<bool, EngineError>;

/// Engine factories in priority order (first registered wins)
#[derive(Clone, Default)]
pub struct EngineRegistry {
    factories: IndexMap<String, Arc<dyn EngineFactory>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Registering a name twice replaces the factory but
    /// keeps its original priority.
    pub fn register<F: EngineFactory + 'static>(&mut self, factory: F) -> &mut Self {
        self.register_shared(Arc::new(factory))
    }

    pub fn register_shared(&mut self, factory: Arc<dyn EngineFactory>) -> &mut Self {
        self.factories.insert(factory.name().to_string(), factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EngineFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<dyn EngineFactory>> {
        self.factories.values()
    }
}

/// Picks the engine factory the rest of the process will use
pub struct EngineSelector {
    registry: EngineRegistry,
    default_engine_name: Option<String>,
}

/// The default selection probe: the engine must compute `1 + 1`.
pub fn arithmetic_probe(engine: &mut dyn Engine) -> std::result::Result<bool, EngineError> {
    let value = engine.evaluate("1 + 1")?;
    Ok(value.as_f64() == Value::from(2).as_f64())
}

impl EngineSelector {
    pub fn new(registry: EngineRegistry, default_engine_name: Option<String>) -> Self {
        Self {
            registry,
            default_engine_name,
        }
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Select using the arithmetic probe
    pub fn select(&self) -> Result<Arc<dyn EngineFactory>> {
        self.select_with(&arithmetic_probe)
    }

    /// Select the configured default engine, or else the first candidate whose
    /// trial engine can be created and passes `probe`.
    pub fn select_with(&self, probe: &Probe) -> Result<Arc<dyn EngineFactory>> {
        if self.registry.is_empty() {
            return Err(Error::NoEnginesRegistered);
        }

        if let Some(name) = &self.default_engine_name {
            return self.registry.get(name).ok_or_else(|| Error::EngineNotFound {
                message: format!(
                    "No JavaScript engine named \"{}\" is registered (registered: {})",
                    name,
                    self.registry.names().join(", ")
                ),
                failures: Vec::new(),
                hint: None,
            });
        }

        let mut failures = Vec::new();
        let mut hint = None;

        for factory in self.registry.iter() {
            debug!("Trying JavaScript engine {}", factory.name());
            let mut engine = match factory.create() {
                Ok(engine) => engine,
                Err(err) => {
                    warn!("Could not create {} engine: {}", factory.name(), err);
                    if hint.is_none() {
                        hint = factory.diagnose(&err);
                    }
                    failures.push(CandidateFailure {
                        engine: factory.name().to_string(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let outcome = probe(engine.as_mut());
            engine.dispose();

            match outcome {
                Ok(true) => {
                    info!("Using JavaScript engine {} {}", factory.name(), engine.version());
                    return Ok(Arc::clone(factory));
                }
                Ok(false) => failures.push(CandidateFailure {
                    engine: factory.name().to_string(),
                    reason: "engine returned an unexpected result for the test script".to_string(),
                }),
                Err(err) => failures.push(CandidateFailure {
                    engine: factory.name().to_string(),
                    reason: err.to_string(),
                }),
            }
        }

        Err(Error::EngineNotFound {
            message: "No usable JavaScript engine was found. Tried:".to_string(),
            failures,
            hint,
        })
    }
}
