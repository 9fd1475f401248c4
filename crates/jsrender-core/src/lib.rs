pub mod cache;
pub mod config;
pub mod di;
pub mod engine;
pub mod environment;
pub mod error;
pub mod fs;
pub mod hash;
pub mod sourcemap;
pub mod transform;
pub mod watch;

pub use cache::{ArtifactCache, CacheItem, MemoryCache, NullCache};
pub use config::{CliOverrides, RenderConfig};
pub use di::Container;
pub use engine::{
    Engine, EngineError, EngineFactory, EngineLease, EngineManager, EnginePool, EngineRegistry,
    EngineSelector, PoolConfig, ScriptError,
};
pub use environment::{
    Component, ComponentOptions, ConsoleEntry, EnvironmentState, ExceptionHandler,
    RenderEnvironment,
};
pub use error::{Error, Result};
pub use hash::HashValidator;
pub use sourcemap::SourceMap;
pub use transform::{TransformResult, Transformer};
