use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use tracing::{debug, info, warn};

use super::{
    Engine, EngineError, EngineFactory, EnginePool, EngineRegistry, EngineSelector, PooledEngine,
    PrecompiledScript, SharedEngine, ThreadLocalEngines,
};
use crate::cache::{ArtifactCache, CacheItem};
use crate::config::RenderConfig;
use crate::error::{Error, Result};
use crate::fs::FileSystem;

/// Name of the thread used to retry calls with a larger stack
pub const LARGE_STACK_THREAD_NAME: &str = "jsrender-large-stack";

const PRECOMPILED_FILE_PREFIX: &str = "PRECOMPILED_FILE_";
const PRECOMPILED_RESOURCE_PREFIX: &str = "PRECOMPILED_RESOURCE_";
const TRANSPILER_LOADED_VARIABLE: &str = "__jsrenderTranspilerLoaded";

/// An engine handed out by [`EngineManager::get_engine`]
pub enum EngineLease {
    Pooled(PooledEngine),
    ThreadLocal(SharedEngine),
}

impl EngineLease {
    /// Run `f` with exclusive access to the engine
    pub fn with<R>(&mut self, f: impl FnOnce(&mut dyn Engine) -> R) -> R {
        match self {
            EngineLease::Pooled(engine) => f(&mut **engine),
            EngineLease::ThreadLocal(shared) => {
                let mut engine = shared.lock().unwrap_or_else(PoisonError::into_inner);
                f(engine.as_mut())
            }
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self, EngineLease::Pooled(_))
    }
}

/// Loads the bootstrap scripts into fresh engines
struct Bootstrap {
    config: Arc<RenderConfig>,
    fs: Arc<dyn FileSystem>,
    cache: Arc<dyn ArtifactCache>,
}

impl Bootstrap {
    fn precompile(&self, engine: &dyn Engine) -> bool {
        self.config.allow_precompilation && engine.supports_precompilation()
    }

    /// Shims, then library scripts, then scripts that need no transform
    fn initialize(&self, engine: &mut dyn Engine) -> Result<()> {
        self.execute_resource(engine, jsrender_runtime::SHIMS_RESOURCE)?;
        for file in &self.config.library_scripts {
            self.execute_file(engine, file)?;
        }
        for file in &self.config.scripts_without_transform {
            self.execute_file(engine, file)?;
        }
        Ok(())
    }

    fn execute_resource(&self, engine: &mut dyn Engine, name: &str) -> Result<()> {
        let code = jsrender_runtime::resource(name)
            .ok_or_else(|| Error::Config(format!("Unknown embedded resource \"{}\"", name)))?;

        if !self.precompile(engine) {
            return engine
                .execute(code, name)
                .map_err(|e| Error::from(e).into_script_load(name));
        }

        let key = format!("{}{}", PRECOMPILED_RESOURCE_PREFIX, name);
        let script = self
            .precompiled(engine, &key, code, name, &[])
            .map_err(|e| e.into_script_load(name))?;
        engine
            .execute_precompiled(&script)
            .map_err(|e| Error::from(e).into_script_load(name))
    }

    fn execute_file(&self, engine: &mut dyn Engine, file: &str) -> Result<()> {
        let path = self.fs.map_path(file);
        let read = || {
            self.fs
                .read_text(&path)
                .map_err(|e| Error::from(e).into_script_load(file))
        };

        if !self.precompile(engine) {
            let code = read()?;
            return engine
                .execute(&code, file)
                .map_err(|e| Error::from(e).into_script_load(file));
        }

        let key = format!("{}{}", PRECOMPILED_FILE_PREFIX, path.display());
        let script = match self.cached_precompiled(engine, &key) {
            Some(script) => script,
            None => {
                let code = read()?;
                self.precompiled(engine, &key, &code, file, &[path.clone()])
                    .map_err(|e| e.into_script_load(file))?
            }
        };
        engine
            .execute_precompiled(&script)
            .map_err(|e| Error::from(e).into_script_load(file))
    }

    fn cached_precompiled(&self, engine: &dyn Engine, key: &str) -> Option<Arc<PrecompiledScript>> {
        let item = self.cache.get(key)?;
        let script = item.as_precompiled()?;
        (script.engine == engine.name()).then(|| Arc::clone(script))
    }

    fn precompiled(
        &self,
        engine: &mut dyn Engine,
        key: &str,
        code: &str,
        document: &str,
        dependencies: &[PathBuf],
    ) -> Result<Arc<PrecompiledScript>> {
        if let Some(script) = self.cached_precompiled(engine, key) {
            return Ok(script);
        }
        debug!("Precompiling {}", document);
        let script = Arc::new(engine.precompile(code, document)?);
        self.cache.set(
            key,
            CacheItem::Precompiled(Arc::clone(&script)),
            self.config.cache_sliding_expiration(),
            dependencies,
        );
        Ok(script)
    }

    /// Load the transpiler into `engine` unless it already has it
    fn ensure_transpiler(&self, engine: &mut dyn Engine) -> Result<()> {
        if !engine.supports_transformation() {
            return Err(Error::Engine(EngineError::Unsupported(format!(
                "Transpiling with the {} engine",
                engine.name()
            ))));
        }
        if engine.has_variable(TRANSPILER_LOADED_VARIABLE)? {
            return Ok(());
        }
        if !self.config.load_transpiler {
            return Err(Error::Config(
                "Transpiling requires the transpiler, but loadTranspiler is disabled".to_string(),
            ));
        }

        for file in &self.config.transpiler_scripts {
            self.execute_file(engine, file)?;
        }
        self.execute_resource(engine, jsrender_runtime::TRANSFORM_RESOURCE)?;
        engine.set_variable(TRANSPILER_LOADED_VARIABLE, Value::Bool(true))?;
        debug!("Transpiler loaded into {} engine", engine.name());
        Ok(())
    }
}

/// Owns the selected engine factory, the pool and the thread-local arena
pub struct EngineManager {
    config: Arc<RenderConfig>,
    factory: Arc<dyn EngineFactory>,
    bootstrap: Arc<Bootstrap>,
    pool: Option<Arc<EnginePool>>,
    thread_engines: Arc<ThreadLocalEngines>,
}

impl EngineManager {
    /// Select an engine from `registry` and, when engines are reused, start
    /// the pool (watching every configured script for changes).
    pub fn new(
        config: Arc<RenderConfig>,
        registry: EngineRegistry,
        fs: Arc<dyn FileSystem>,
        cache: Arc<dyn ArtifactCache>,
    ) -> Result<Self> {
        config.validate()?;
        let selector = EngineSelector::new(registry, config.default_engine_name.clone());
        let factory = selector.select()?;

        let pool_config = config.pool_config(fs.as_ref());
        let bootstrap = Arc::new(Bootstrap {
            config: Arc::clone(&config),
            fs,
            cache,
        });

        let thread_engines = Arc::new(ThreadLocalEngines::new());
        let pool = if config.reuse_engines {
            let initializer = Arc::clone(&bootstrap);
            let transpilers = Arc::clone(&thread_engines);
            let pool_config = pool_config
                .with_initializer(move |engine| initializer.initialize(engine))
                .with_recycle_hook(move || transpilers.dispose_all());
            info!(
                "Starting {} engine pool ({}..{} engines)",
                factory.name(),
                pool_config.min_engines,
                pool_config.max_engines
            );
            Some(EnginePool::new(Arc::clone(&factory), pool_config))
        } else {
            None
        };

        Ok(Self {
            config,
            factory,
            bootstrap,
            pool,
            thread_engines,
        })
    }

    pub fn config(&self) -> &Arc<RenderConfig> {
        &self.config
    }

    pub fn factory(&self) -> &Arc<dyn EngineFactory> {
        &self.factory
    }

    pub fn engine_name(&self) -> &str {
        self.factory.name()
    }

    pub fn pool(&self) -> Option<&Arc<EnginePool>> {
        self.pool.as_ref()
    }

    /// Create a bootstrapped engine outside of both arenas
    pub fn create_engine(&self) -> Result<Box<dyn Engine>> {
        let mut engine = self.factory.create()?;
        if let Err(e) = self.bootstrap.initialize(engine.as_mut()) {
            engine.dispose();
            return Err(e);
        }
        Ok(engine)
    }

    /// A pooled engine when engines are reused, the thread-local one otherwise
    pub fn get_engine(&self) -> Result<EngineLease> {
        match &self.pool {
            Some(pool) => Ok(EngineLease::Pooled(pool.lease()?)),
            None => Ok(EngineLease::ThreadLocal(
                self.get_engine_for_current_thread()?,
            )),
        }
    }

    /// The current thread's non-pooled engine
    pub fn get_engine_for_current_thread(&self) -> Result<SharedEngine> {
        self.thread_engines.get_or_create(|| self.create_engine())
    }

    pub fn dispose_engine_for_current_thread(&self) -> bool {
        self.thread_engines.dispose_current()
    }

    /// Give an engine back. Thread-local engines stay with their thread.
    pub fn return_engine_to_pool(&self, lease: EngineLease) {
        drop(lease);
    }

    /// Throw away every initialised engine so that the next request sees
    /// fresh scripts. Pooled recycles also drop the thread-local transpiler
    /// engines.
    pub fn recycle(&self) -> Result<()> {
        match &self.pool {
            Some(pool) => pool.recycle(),
            None => {
                self.thread_engines.dispose_all();
                Ok(())
            }
        }
    }

    pub fn dispose(&self) {
        if let Some(pool) = &self.pool {
            pool.dispose();
        }
        self.thread_engines.dispose_all();
    }

    /// Call a transpiler function, retrying once on a thread with a larger
    /// stack when the first attempt fails.
    ///
    /// Deeply nested sources can overflow the engine's stack on a normal
    /// thread. Engines do not report that reliably, so any failure triggers
    /// the retry; the retry's error is the one returned.
    pub fn execute_with_larger_stack_if_required<T: DeserializeOwned>(
        &self,
        function: &str,
        args: &[Value],
    ) -> Result<T> {
        let error = match self.call_on_current_thread(function, args) {
            Ok(value) => return Ok(serde_json::from_value(value)?),
            Err(e) => e,
        };

        warn!(
            "{} failed ({}), retrying on a thread with a {} byte stack",
            function, error, self.config.large_stack_size
        );

        let value = std::thread::scope(|scope| -> Result<Value> {
            let worker = std::thread::Builder::new()
                .name(LARGE_STACK_THREAD_NAME.to_string())
                .stack_size(self.config.large_stack_size)
                .spawn_scoped(scope, || {
                    let result = self.call_on_current_thread(function, args);
                    self.dispose_engine_for_current_thread();
                    result
                })?;
            worker.join().unwrap_or_else(|_| {
                Err(Error::RuntimeExecution {
                    message: format!("{} panicked on the large-stack thread", function),
                    line: None,
                    column: None,
                })
            })
        })?;

        Ok(serde_json::from_value(value)?)
    }

    fn call_on_current_thread(&self, function: &str, args: &[Value]) -> Result<Value> {
        let shared = self.get_engine_for_current_thread()?;
        let mut engine = shared.lock().unwrap_or_else(PoisonError::into_inner);
        self.bootstrap.ensure_transpiler(engine.as_mut())?;
        Ok(engine.call_function(function, args)?)
    }
}

impl Drop for EngineManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
