use crate::cache::{ArtifactCache, MemoryCache};
use crate::config::RenderConfig;
use crate::engine::{EngineManager, EngineRegistry};
use crate::environment::{ExceptionHandler, RenderEnvironment};
use crate::error::Result;
use crate::fs::{FileSystem, RealFileSystem};
use crate::transform::Transformer;
use std::sync::Arc;

/// Dependency injection container
/// Owns the shared services and creates render environments wired to them
pub struct Container {
    config: Arc<RenderConfig>,
    file_system: Arc<dyn FileSystem>,
    cache: Arc<dyn ArtifactCache>,
    manager: Arc<EngineManager>,
    transformer: Arc<Transformer>,
    exception_handler: Option<ExceptionHandler>,
}

impl Container {
    /// Create a container with production dependencies: the current
    /// directory as application root and a file-watching memory cache
    pub fn new(config: RenderConfig, registry: EngineRegistry) -> Result<Self> {
        let file_system = Arc::new(RealFileSystem::current_dir()?);
        let cache = MemoryCache::with_file_watching();
        Self::with_dependencies(config, registry, file_system, cache)
    }

    /// Create a container with custom dependencies (for testing)
    pub fn with_dependencies(
        config: RenderConfig,
        registry: EngineRegistry,
        file_system: Arc<dyn FileSystem>,
        cache: Arc<dyn ArtifactCache>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let manager = Arc::new(EngineManager::new(
            Arc::clone(&config),
            registry,
            Arc::clone(&file_system),
            Arc::clone(&cache),
        )?);
        let transformer = Arc::new(Transformer::new(
            Arc::clone(&manager),
            Arc::clone(&cache),
            Arc::clone(&file_system),
        ));

        Ok(Container {
            config,
            file_system,
            cache,
            manager,
            transformer,
            exception_handler: None,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Arc<RenderConfig> {
        &self.config
    }

    /// Get the file system
    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.file_system
    }

    pub fn cache(&self) -> &Arc<dyn ArtifactCache> {
        &self.cache
    }

    pub fn engine_manager(&self) -> &Arc<EngineManager> {
        &self.manager
    }

    pub fn transformer(&self) -> &Arc<Transformer> {
        &self.transformer
    }

    /// Handler given to every environment created from now on
    pub fn set_exception_handler(&mut self, handler: Option<ExceptionHandler>) {
        self.exception_handler = handler;
    }

    /// A new environment for one request
    pub fn create_environment(&self) -> RenderEnvironment {
        let mut environment =
            RenderEnvironment::new(Arc::clone(&self.manager), Arc::clone(&self.transformer));
        environment.set_exception_handler(self.exception_handler.clone());
        environment
    }
}
