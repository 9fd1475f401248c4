//! Mock implementations for testing

use jsrender_core::cache::{ArtifactCache, CacheItem, MemoryCache};
use jsrender_core::engine::mock::MockEngineFactory;
use jsrender_core::{Error, ExceptionHandler};
use jsrender_runtime::shims::{CONSOLE_HISTORY_FUNCTION, RENDER_COMPONENT_FUNCTION};
use jsrender_runtime::transform::{
    TRANSFORM_FUNCTION, TRANSFORM_WITH_SOURCE_MAP_FUNCTION, TRANSPILER_VERSION_FUNCTION,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Prefix the mock transpiler puts in front of every input
pub const COMPILED_MARKER: &str = "/* compiled */";

/// A mock engine factory with the transpiler glue and the render function
/// implemented natively.
///
/// Transpiling prefixes the input with [`COMPILED_MARKER`] on its own line;
/// the source map variant maps every output line to the line before it.
/// Rendering produces `<div>{name}</div>`.
pub fn transpiler_factory(name: &str) -> MockEngineFactory {
    MockEngineFactory::new(name)
        .with_function(TRANSFORM_FUNCTION, |args| {
            Ok(Value::from(compile(args)))
        })
        .with_function(TRANSFORM_WITH_SOURCE_MAP_FUNCTION, |args| {
            let code = compile(args);
            let mappings = (0..code.lines().count())
                .map(|line| if line == 0 { "AAAA" } else { "AACA" })
                .collect::<Vec<_>>()
                .join(";");
            Ok(json!({
                "code": code,
                "sourceMap": {
                    "version": 3,
                    "sources": [args.get(2).cloned().unwrap_or(Value::Null)],
                    "names": [],
                    "mappings": mappings
                }
            }))
        })
        .with_function(TRANSPILER_VERSION_FUNCTION, |_| Ok(Value::from("mock-1.0")))
        .with_function(RENDER_COMPONENT_FUNCTION, |args| {
            let name = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(Value::from(format!("<div>{}</div>", name)))
        })
        .with_function(CONSOLE_HISTORY_FUNCTION, |_| Ok(json!([])))
}

fn compile(args: &[Value]) -> String {
    let input = args.first().and_then(Value::as_str).unwrap_or_default();
    format!("{}\n{}", COMPILED_MARKER, input)
}

/// Number of transpile calls a factory made (with or without source map)
pub fn transpile_count(factory: &MockEngineFactory) -> usize {
    factory
        .function_calls()
        .iter()
        .filter(|name| {
            name.as_str() == TRANSFORM_FUNCTION || name.as_str() == TRANSFORM_WITH_SOURCE_MAP_FUNCTION
        })
        .count()
}

/// An exception handler that records every failure it is given
#[derive(Debug, Default)]
pub struct RecordingExceptionHandler {
    failures: Mutex<Vec<RecordedFailure>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFailure {
    pub component: String,
    pub container_id: String,
    pub message: String,
}

impl RecordingExceptionHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handler(self: &Arc<Self>) -> ExceptionHandler {
        let recorder = Arc::clone(self);
        Arc::new(move |error: &Error, component: &str, container_id: &str| {
            recorder.failures.lock().unwrap().push(RecordedFailure {
                component: component.to_string(),
                container_id: container_id.to_string(),
                message: error.to_string(),
            });
        })
    }

    pub fn failures(&self) -> Vec<RecordedFailure> {
        self.failures.lock().unwrap().clone()
    }
}

/// A memory cache that counts hits, misses and writes
#[derive(Default)]
pub struct CountingCache {
    inner: MemoryCache,
    hits: AtomicUsize,
    misses: AtomicUsize,
    sets: AtomicUsize,
}

impl CountingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryCache {
        &self.inner
    }
}

impl ArtifactCache for CountingCache {
    fn get(&self, key: &str) -> Option<CacheItem> {
        let item = self.inner.get(key);
        let counter = if item.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::SeqCst);
        item
    }

    fn set(&self, key: &str, item: CacheItem, sliding_expiration: Duration, dependencies: &[PathBuf]) {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, item, sliding_expiration, dependencies);
    }

    fn remove(&self, key: &str) {
        self.inner.remove(key);
    }
}
