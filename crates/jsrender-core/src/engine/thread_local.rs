use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::ThreadId;
use tracing::debug;

use super::Engine;
use crate::error::Result;

/// An engine owned by the thread-local arena
pub type SharedEngine = Arc<Mutex<Box<dyn Engine>>>;

thread_local! {
    /// Dropped when the thread exits
    static THREAD_ALIVE: Arc<()> = Arc::new(());
}

struct ThreadEngine {
    engine: SharedEngine,
    alive: Weak<()>,
}

/// One non-pooled engine per thread.
///
/// Used when engine reuse is disabled and for transpiling. Engines here are
/// never handed to the pool. Engines of exited threads are disposed the next
/// time an engine is created.
#[derive(Default)]
pub struct ThreadLocalEngines {
    engines: Mutex<FxHashMap<ThreadId, ThreadEngine>>,
}

impl ThreadLocalEngines {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<ThreadId, ThreadEngine>> {
        self.engines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current thread's engine, if it has one that is still alive
    pub fn get(&self) -> Option<SharedEngine> {
        let id = std::thread::current().id();
        let engine = self.lock().get(&id).map(|entry| Arc::clone(&entry.engine))?;
        let disposed = engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_disposed();
        if disposed {
            self.lock().remove(&id);
            None
        } else {
            Some(engine)
        }
    }

    /// The current thread's engine, created with `create` on first use
    pub fn get_or_create<F>(&self, create: F) -> Result<SharedEngine>
    where
        F: FnOnce() -> Result<Box<dyn Engine>>,
    {
        if let Some(engine) = self.get() {
            return Ok(engine);
        }

        let engine: SharedEngine = Arc::new(Mutex::new(create()?));
        let id = std::thread::current().id();
        debug!("Created thread-local engine for {:?}", id);

        let exited: Vec<SharedEngine> = {
            let mut engines = self.lock();
            let mut exited = Vec::new();
            engines.retain(|_, entry| {
                if entry.alive.strong_count() > 0 {
                    return true;
                }
                exited.push(Arc::clone(&entry.engine));
                false
            });
            engines.insert(
                id,
                ThreadEngine {
                    engine: Arc::clone(&engine),
                    alive: THREAD_ALIVE.with(Arc::downgrade),
                },
            );
            exited
        };
        if !exited.is_empty() {
            debug!("Disposing {} engines of exited threads", exited.len());
            dispose(exited);
        }
        Ok(engine)
    }

    /// Dispose the current thread's engine. Returns whether there was one.
    ///
    /// Must not be called while the current thread holds the engine's lock.
    pub fn dispose_current(&self) -> bool {
        let id = std::thread::current().id();
        let engine = self.lock().remove(&id);
        match engine {
            Some(ThreadEngine { engine, .. }) => {
                engine
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .dispose();
                debug!("Disposed thread-local engine for {:?}", id);
                true
            }
            None => false,
        }
    }

    /// Dispose every thread's engine, waiting for engines in use
    pub fn dispose_all(&self) {
        let engines: Vec<SharedEngine> = self
            .lock()
            .drain()
            .map(|(_, entry)| entry.engine)
            .collect();
        dispose(engines);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn dispose(engines: Vec<SharedEngine>) {
    for engine in engines {
        engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngineFactory;
    use crate::engine::{Engine, EngineFactory};

    #[test]
    fn test_one_engine_per_thread() {
        let factory = MockEngineFactory::new("mock");
        let engines = ThreadLocalEngines::new();
        let create = || -> Result<Box<dyn Engine>> { Ok(factory.create()?) };

        let a = engines.get_or_create(create).unwrap();
        let b = engines.get_or_create(create).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let other = engines.get_or_create(create).unwrap();
                assert!(!Arc::ptr_eq(&a, &other));
            });
        });

        assert_eq!(engines.len(), 2);
        assert_eq!(factory.created(), 2);
    }

    #[test]
    fn test_dispose_current_only_touches_current_thread() {
        let factory = MockEngineFactory::new("mock");
        let engines = ThreadLocalEngines::new();
        let create = || -> Result<Box<dyn Engine>> { Ok(factory.create()?) };

        engines.get_or_create(create).unwrap();
        std::thread::scope(|scope| {
            scope.spawn(|| engines.get_or_create(create).unwrap());
        });

        assert!(engines.dispose_current());
        assert!(!engines.dispose_current());
        assert_eq!(factory.disposed(), 1);
        assert_eq!(engines.len(), 1);

        engines.dispose_all();
        assert!(engines.is_empty());
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn test_disposed_engine_is_replaced() {
        let factory = MockEngineFactory::new("mock");
        let engines = ThreadLocalEngines::new();
        let create = || -> Result<Box<dyn Engine>> { Ok(factory.create()?) };

        let first = engines.get_or_create(create).unwrap();
        first.lock().unwrap().dispose();

        let second = engines.get_or_create(create).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_engines_of_exited_threads_are_disposed() {
        let factory = MockEngineFactory::new("mock");
        let engines = Arc::new(ThreadLocalEngines::new());

        let worker = {
            let engines = Arc::clone(&engines);
            let factory = factory.clone();
            std::thread::spawn(move || {
                engines
                    .get_or_create(|| -> Result<Box<dyn Engine>> { Ok(factory.create()?) })
                    .unwrap();
            })
        };
        worker.join().unwrap();
        assert_eq!(engines.len(), 1);
        assert_eq!(factory.disposed(), 0);

        engines
            .get_or_create(|| -> Result<Box<dyn Engine>> { Ok(factory.create()?) })
            .unwrap();
        assert_eq!(engines.len(), 1);
        assert_eq!(factory.disposed(), 1);
        assert_eq!(factory.live(), 1);
    }
}
