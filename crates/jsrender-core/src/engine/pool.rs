use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::{Engine, EngineError, EngineFactory};
use crate::error::{Error, Result};
use crate::watch::{try_watch, FileWatcher};

/// Prepares a freshly created engine before it joins the pool
pub type Initializer = Arc<dyn Fn(&mut dyn Engine) -> Result<()> + Send + Sync>;

/// Runs on every recycle, before the fresh generation is warmed
pub type RecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Pool sizing and lifecycle settings
#[derive(Clone)]
pub struct PoolConfig {
    /// Engines created at construction and after every recycle
    pub min_engines: usize,

    /// Upper bound on live engines, idle and leased
    pub max_engines: usize,

    /// Leases before an engine is retired (0 = unlimited)
    pub max_usages_per_engine: usize,

    /// Files whose modification recycles the pool
    pub watch_paths: Vec<PathBuf>,

    pub initializer: Option<Initializer>,

    pub on_recycle: Option<RecycleHook>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_engines: 10,
            max_engines: 25,
            max_usages_per_engine: 100,
            watch_paths: Vec::new(),
            initializer: None,
            on_recycle: None,
        }
    }
}

impl PoolConfig {
    pub fn with_initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&mut dyn Engine) -> Result<()> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    pub fn with_recycle_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_recycle = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min_engines", &self.min_engines)
            .field("max_engines", &self.max_engines)
            .field("max_usages_per_engine", &self.max_usages_per_engine)
            .field("watch_paths", &self.watch_paths)
            .field("initializer", &self.initializer.is_some())
            .field("on_recycle", &self.on_recycle.is_some())
            .finish()
    }
}

/// A point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub generation: u64,
    pub faulted: bool,
}

struct Slot {
    engine: Box<dyn Engine>,
    id: u64,
    usages: usize,
    generation: u64,
}

struct PoolState {
    idle: VecDeque<Slot>,
    /// Idle, leased and under-construction engines
    live: usize,
    generation: u64,
    next_id: u64,
    last_init_error: Option<Arc<Error>>,
    disposed: bool,
}

impl PoolState {
    fn reserve(&mut self) -> (u64, u64) {
        self.live += 1;
        self.next_id += 1;
        (self.next_id, self.generation)
    }
}

/// A bounded pool of initialised engines.
///
/// `lease` hands out an engine exclusively; dropping the returned
/// [`PooledEngine`] gives it back. When the initializer fails the error is
/// kept as a sticky fault and returned by every lease until a recycle
/// succeeds.
pub struct EnginePool {
    factory: Arc<dyn EngineFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    watcher: Mutex<Option<FileWatcher>>,
}

impl EnginePool {
    /// Create the pool and warm `min_engines` engines. A warm-up failure does
    /// not fail construction; it becomes the sticky fault.
    pub fn new(factory: Arc<dyn EngineFactory>, mut config: PoolConfig) -> Arc<Self> {
        config.max_engines = config.max_engines.max(1);
        config.min_engines = config.min_engines.min(config.max_engines);
        let watch_paths = std::mem::take(&mut config.watch_paths);

        let pool = Arc::new(Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                generation: 0,
                next_id: 0,
                last_init_error: None,
                disposed: false,
            }),
            available: Condvar::new(),
            watcher: Mutex::new(None),
        });

        if let Err(e) = pool.warm(0) {
            warn!("Engine pool warm-up failed: {}", e);
        }

        if !watch_paths.is_empty() {
            let weak = Arc::downgrade(&pool);
            let watcher = try_watch(&watch_paths, move |path| {
                if let Some(pool) = weak.upgrade() {
                    info!("{:?} changed, recycling engine pool", path);
                    if let Err(e) = pool.recycle() {
                        warn!("Engine pool recycle failed: {}", e);
                    }
                }
            });
            *pool.watcher.lock().unwrap_or_else(PoisonError::into_inner) = watcher;
        }

        pool
    }

    pub fn factory(&self) -> &Arc<dyn EngineFactory> {
        &self.factory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_engine(&self) -> Result<Box<dyn Engine>> {
        let mut engine = self.factory.create()?;
        if let Some(initializer) = &self.config.initializer {
            if let Err(e) = initializer(engine.as_mut()) {
                engine.dispose();
                return Err(e);
            }
        }
        debug!("Created {} engine", self.factory.name());
        Ok(engine)
    }

    fn publish_fault(&self, state: &mut PoolState, error: Error) -> Arc<Error> {
        warn!("Engine initialisation failed, pool is faulted: {}", error);
        let fault = Arc::new(error);
        state.last_init_error = Some(Arc::clone(&fault));
        self.available.notify_all();
        fault
    }

    /// Fill the idle set up to `min_engines` for `generation`
    fn warm(&self, generation: u64) -> Result<()> {
        loop {
            let (id, _) = {
                let mut state = self.lock();
                if state.disposed
                    || state.generation != generation
                    || state.idle.len() >= self.config.min_engines
                    || state.live >= self.config.max_engines
                {
                    return Ok(());
                }
                state.reserve()
            };

            match self.create_engine() {
                Ok(mut engine) => {
                    let mut state = self.lock();
                    if state.disposed || state.generation != generation {
                        state.live -= 1;
                        drop(state);
                        engine.dispose();
                        return Ok(());
                    }
                    state.idle.push_back(Slot {
                        engine,
                        id,
                        usages: 0,
                        generation,
                    });
                    self.available.notify_one();
                }
                Err(e) => {
                    let mut state = self.lock();
                    state.live -= 1;
                    if state.disposed || state.generation != generation {
                        debug!(
                            "Ignoring initialisation failure of stale generation {}: {}",
                            generation, e
                        );
                        self.available.notify_all();
                        return Ok(());
                    }
                    let fault = self.publish_fault(&mut state, e);
                    return Err(Error::EngineInitialization(fault));
                }
            }
        }
    }

    /// Create an engine for a lease. `None` means the failure belonged to a
    /// generation that has since been recycled and the caller should retry.
    fn grow(self: &Arc<Self>, id: u64, generation: u64) -> Result<Option<PooledEngine>> {
        match self.create_engine() {
            Ok(engine) => Ok(Some(self.checkout(Slot {
                engine,
                id,
                usages: 0,
                generation,
            }))),
            Err(e) => {
                let mut state = self.lock();
                state.live -= 1;
                if state.disposed {
                    self.available.notify_all();
                    return Err(Error::PoolDisposed);
                }
                if state.generation != generation {
                    debug!(
                        "Ignoring initialisation failure of stale generation {}: {}",
                        generation, e
                    );
                    self.available.notify_all();
                    return Ok(None);
                }
                let fault = self.publish_fault(&mut state, e);
                Err(Error::EngineInitialization(fault))
            }
        }
    }

    fn checkout(self: &Arc<Self>, mut slot: Slot) -> PooledEngine {
        slot.usages += 1;
        PooledEngine {
            pool: Arc::clone(self),
            engine: slot.engine,
            id: slot.id,
            usages: slot.usages,
            generation: slot.generation,
        }
    }

    /// Lease an engine, blocking while the pool is at capacity
    pub fn lease(self: &Arc<Self>) -> Result<PooledEngine> {
        self.acquire(true)
            .and_then(|engine| engine.ok_or(Error::PoolDisposed))
    }

    /// Lease an engine, or `None` when every engine is in use and the pool
    /// cannot grow
    pub fn try_lease(self: &Arc<Self>) -> Result<Option<PooledEngine>> {
        self.acquire(false)
    }

    fn acquire(self: &Arc<Self>, wait: bool) -> Result<Option<PooledEngine>> {
        let mut state = self.lock();
        loop {
            if state.disposed {
                return Err(Error::PoolDisposed);
            }
            if let Some(fault) = &state.last_init_error {
                return Err(Error::EngineInitialization(Arc::clone(fault)));
            }

            if let Some(slot) = state.idle.pop_front() {
                if slot.engine.is_disposed() {
                    state.live -= 1;
                    continue;
                }
                return Ok(Some(self.checkout(slot)));
            }

            if state.live < self.config.max_engines {
                let (id, generation) = state.reserve();
                drop(state);
                if let Some(engine) = self.grow(id, generation)? {
                    return Ok(Some(engine));
                }
                state = self.lock();
                continue;
            }

            if !wait {
                return Ok(None);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self, mut slot: Slot) {
        let mut state = self.lock();
        let max_usages = self.config.max_usages_per_engine;
        let retire = state.disposed
            || slot.generation != state.generation
            || slot.engine.is_disposed()
            || (max_usages > 0 && slot.usages >= max_usages);

        if !retire {
            state.idle.push_back(slot);
            self.available.notify_one();
            return;
        }

        state.live -= 1;
        self.available.notify_one();
        drop(state);
        debug!(
            "Retiring engine {} after {} uses (generation {})",
            slot.id, slot.usages, slot.generation
        );
        slot.engine.dispose();
    }

    /// Dispose idle engines, mark leased ones for disposal on release and warm
    /// a fresh set. Clears the sticky fault unless the warm-up fails again.
    pub fn recycle(&self) -> Result<()> {
        let (stale, generation) = {
            let mut state = self.lock();
            if state.disposed {
                return Err(Error::PoolDisposed);
            }
            state.last_init_error = None;
            state.generation += 1;
            let stale: Vec<Slot> = state.idle.drain(..).collect();
            state.live -= stale.len();
            (stale, state.generation)
        };

        info!(
            "Recycling engine pool: generation {}, {} idle engines disposed",
            generation,
            stale.len()
        );
        for mut slot in stale {
            slot.engine.dispose();
        }
        self.available.notify_all();

        if let Some(hook) = &self.config.on_recycle {
            hook();
        }
        self.warm(generation)
    }

    /// Dispose every idle engine and reject further leases. Leased engines are
    /// disposed when they come back.
    pub fn dispose(&self) {
        let stale: Vec<Slot> = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let stale: Vec<Slot> = state.idle.drain(..).collect();
            state.live -= stale.len();
            stale
        };
        self.available.notify_all();
        for mut slot in stale {
            slot.engine.dispose();
        }
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!("Engine pool disposed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            in_use: state.live - state.idle.len(),
            generation: state.generation,
            faulted: state.last_init_error.is_some(),
        }
    }

    /// The sticky fault, if any
    pub fn last_init_error(&self) -> Option<Arc<Error>> {
        self.lock().last_init_error.clone()
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// An engine leased from an [`EnginePool`]; returned to the pool on drop
pub struct PooledEngine {
    pool: Arc<EnginePool>,
    engine: Box<dyn Engine>,
    id: u64,
    usages: usize,
    generation: u64,
}

impl PooledEngine {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Leases of this engine so far, including the current one
    pub fn usages(&self) -> usize {
        self.usages
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Give the engine back to the pool now
    pub fn release(self) {
        drop(self);
    }

    /// Dispose the engine instead of giving it back, e.g. when it was left
    /// half-initialised
    pub fn discard(mut self) {
        self.engine.dispose();
    }
}

impl Deref for PooledEngine {
    type Target = dyn Engine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl DerefMut for PooledEngine {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine.as_mut()
    }
}

impl Drop for PooledEngine {
    fn drop(&mut self) {
        let engine = std::mem::replace(&mut self.engine, Box::new(Released));
        self.pool.release(Slot {
            engine,
            id: self.id,
            usages: self.usages,
            generation: self.generation,
        });
    }
}

/// Stands in for an engine that has been handed back
struct Released;

impl Engine for Released {
    fn name(&self) -> &str {
        "released"
    }

    fn version(&self) -> &str {
        ""
    }

    fn execute(&mut self, _code: &str, _document: &str) -> std::result::Result<(), EngineError> {
        Err(EngineError::Disposed)
    }

    fn evaluate(&mut self, _code: &str) -> std::result::Result<Value, EngineError> {
        Err(EngineError::Disposed)
    }

    fn call_function(
        &mut self,
        _name: &str,
        _args: &[Value],
    ) -> std::result::Result<Value, EngineError> {
        Err(EngineError::Disposed)
    }

    fn has_variable(&mut self, _name: &str) -> std::result::Result<bool, EngineError> {
        Err(EngineError::Disposed)
    }

    fn set_variable(&mut self, _name: &str, _value: Value) -> std::result::Result<(), EngineError> {
        Err(EngineError::Disposed)
    }

    fn dispose(&mut self) {}

    fn is_disposed(&self) -> bool {
        true
    }
}
