//! In-memory artifact cache
//!
//! Holds transform results and precompiled scripts between requests. Entries
//! expire after a sliding window without access and are evicted as soon as a
//! file they depend on changes.

mod memory;

pub use memory::MemoryCache;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::PrecompiledScript;
use crate::transform::TransformResult;

/// A cached artifact
#[derive(Debug, Clone)]
pub enum CacheItem {
    Transform(Arc<TransformResult>),
    Precompiled(Arc<PrecompiledScript>),
}

impl CacheItem {
    pub fn as_transform(&self) -> Option<&Arc<TransformResult>> {
        match self {
            CacheItem::Transform(result) => Some(result),
            CacheItem::Precompiled(_) => None,
        }
    }

    pub fn as_precompiled(&self) -> Option<&Arc<PrecompiledScript>> {
        match self {
            CacheItem::Precompiled(script) => Some(script),
            CacheItem::Transform(_) => None,
        }
    }
}

/// Key/value cache with sliding expiration and file dependencies
pub trait ArtifactCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheItem>;

    /// Store `item`. It expires once `sliding_expiration` passes without a
    /// `get`, or when any of `dependencies` changes on disk.
    fn set(
        &self,
        key: &str,
        item: CacheItem,
        sliding_expiration: Duration,
        dependencies: &[PathBuf],
    );

    fn remove(&self, key: &str);
}

/// A cache that never stores anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl ArtifactCache for NullCache {
    fn get(&self, _key: &str) -> Option<CacheItem> {
        None
    }

    fn set(&self, _key: &str, _item: CacheItem, _sliding: Duration, _dependencies: &[PathBuf]) {}

    fn remove(&self, _key: &str) {}
}
