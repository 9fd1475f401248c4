use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{ArtifactCache, CacheItem};
use crate::watch::FileWatcher;

struct Entry {
    item: CacheItem,
    sliding_expiration: Duration,
    last_access: Instant,
    dependencies: Vec<PathBuf>,
}

impl Entry {
    fn expires_at(&self) -> Option<Instant> {
        (!self.sliding_expiration.is_zero()).then(|| self.last_access + self.sliding_expiration)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at().is_some_and(|at| now > at)
    }

    fn depends_on(&self, path: &Path, canonical: Option<&Path>) -> bool {
        self.dependencies
            .iter()
            .any(|dependency| dependency == path || Some(dependency.as_path()) == canonical)
    }
}

#[derive(Default)]
struct Entries {
    map: FxHashMap<String, Entry>,
    /// No entry expires before this instant
    next_expiry: Option<Instant>,
}

impl Entries {
    /// Remove matching entries and return the dependencies no remaining
    /// entry refers to
    fn remove_where(&mut self, mut remove: impl FnMut(&Entry) -> bool) -> Vec<PathBuf> {
        let mut released = Vec::new();
        self.map.retain(|_, entry| {
            if remove(entry) {
                released.append(&mut entry.dependencies);
                false
            } else {
                true
            }
        });
        self.next_expiry = self.map.values().filter_map(Entry::expires_at).min();
        self.orphaned(released)
    }

    fn orphaned(&self, mut dependencies: Vec<PathBuf>) -> Vec<PathBuf> {
        dependencies.sort();
        dependencies.dedup();
        dependencies.retain(|dependency| {
            !self
                .map
                .values()
                .any(|entry| entry.dependencies.contains(dependency))
        });
        dependencies
    }
}

/// Process-wide [`ArtifactCache`].
///
/// A zero sliding expiration keeps the entry until a dependency changes.
/// Expired entries are dropped when read and swept on insert once the
/// earliest expiry has passed. Concurrent writers to the same key race; the
/// last one wins.
pub struct MemoryCache {
    entries: Mutex<Entries>,
    watcher: Option<FileWatcher>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// A cache that only evicts on expiry or explicit invalidation
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            watcher: None,
        }
    }

    /// A cache that watches every dependency and evicts dependent entries
    /// when the file changes
    pub fn with_file_watching() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<MemoryCache>| {
            let weak = weak.clone();
            let watcher = FileWatcher::new(move |path: &Path| {
                if let Some(cache) = weak.upgrade() {
                    cache.invalidate_dependency(path);
                }
            });
            let watcher = match watcher {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("Cache dependency watching disabled: {}", e);
                    None
                }
            };
            Self {
                entries: Mutex::new(Entries::default()),
                watcher,
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers hold the entries lock
    fn unwatch(&self, dependencies: Vec<PathBuf>) {
        if let Some(watcher) = &self.watcher {
            for dependency in dependencies {
                watcher.unwatch(&dependency);
            }
        }
    }

    /// Evict every entry depending on `path`. Returns how many were evicted.
    pub fn invalidate_dependency(&self, path: &Path) -> usize {
        let canonical = path.canonicalize().ok();
        let mut entries = self.lock();
        let before = entries.map.len();
        let released = entries.remove_where(|entry| entry.depends_on(path, canonical.as_deref()));
        self.unwatch(released);
        let evicted = before - entries.map.len();
        if evicted > 0 {
            debug!("{:?} changed, evicted {} cache entries", path, evicted);
        }
        evicted
    }

    /// Drop entries whose sliding window has elapsed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.map.len();
        let released = entries.remove_where(|entry| entry.is_expired(now));
        self.unwatch(released);
        before - entries.map.len()
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        let released = entries.remove_where(|_| true);
        self.unwatch(released);
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watcher
            .as_ref()
            .map(|watcher| watcher.is_watching(path))
            .unwrap_or(false)
    }
}

impl ArtifactCache for MemoryCache {
    fn get(&self, key: &str) -> Option<CacheItem> {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired = entries.map.get(key)?.is_expired(now);
        if expired {
            debug!("Cache entry {} expired", key);
            if let Some(entry) = entries.map.remove(key) {
                let released = entries.orphaned(entry.dependencies);
                self.unwatch(released);
            }
            return None;
        }
        let entry = entries.map.get_mut(key)?;
        entry.last_access = now;
        Some(entry.item.clone())
    }

    fn set(
        &self,
        key: &str,
        item: CacheItem,
        sliding_expiration: Duration,
        dependencies: &[PathBuf],
    ) {
        let now = Instant::now();
        let entry = Entry {
            item,
            sliding_expiration,
            last_access: now,
            dependencies: dependencies.to_vec(),
        };

        let mut entries = self.lock();
        let mut released = Vec::new();
        if entries.next_expiry.is_some_and(|at| now > at) {
            let before = entries.map.len();
            released = entries.remove_where(|entry| entry.is_expired(now));
            debug!("Purged {} expired cache entries", before - entries.map.len());
        }
        if let Some(at) = entry.expires_at() {
            entries.next_expiry = Some(entries.next_expiry.map_or(at, |next| next.min(at)));
        }
        if let Some(replaced) = entries.map.insert(key.to_string(), entry) {
            released.extend(replaced.dependencies);
        }
        let released = entries.orphaned(released);
        self.unwatch(released);

        if let Some(watcher) = &self.watcher {
            for dependency in dependencies {
                if let Err(e) = watcher.watch(dependency) {
                    warn!("Failed to watch cache dependency {:?}: {}", dependency, e);
                }
            }
        }
    }

    fn remove(&self, key: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.map.remove(key) {
            let released = entries.orphaned(entry.dependencies);
            self.unwatch(released);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformResult;
    use tempfile::TempDir;

    fn item(code: &str) -> CacheItem {
        CacheItem::Transform(Arc::new(TransformResult {
            code: code.to_string(),
            source_map: None,
            hash: "hash".to_string(),
            transpiler_version: "1".to_string(),
        }))
    }

    fn code_of(item: Option<CacheItem>) -> Option<String> {
        item.and_then(|item| item.as_transform().map(|result| result.code.clone()))
    }

    #[test]
    fn test_set_then_get() {
        let cache = MemoryCache::new();
        cache.set("a", item("one"), Duration::from_secs(60), &[]);
        assert_eq!(code_of(cache.get("a")), Some("one".to_string()));
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = MemoryCache::new();
        cache.set("a", item("one"), Duration::from_secs(60), &[]);
        cache.set("a", item("two"), Duration::from_secs(60), &[]);
        assert_eq!(code_of(cache.get("a")), Some("two".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sliding_expiration() {
        let cache = MemoryCache::new();
        cache.set("a", item("one"), Duration::from_millis(300), &[]);

        // Each access slides the window forward
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(150));
            assert!(cache.get("a").is_some());
        }

        std::thread::sleep(Duration::from_millis(450));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_expiration_never_expires() {
        let cache = MemoryCache::new();
        cache.set("a", item("one"), Duration::ZERO, &[]);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn test_invalidate_dependency() {
        let cache = MemoryCache::new();
        let app = PathBuf::from("/srv/app.jsx");
        cache.set("a", item("one"), Duration::ZERO, &[app.clone()]);
        cache.set("b", item("two"), Duration::ZERO, &[PathBuf::from("/srv/b.jsx")]);

        assert_eq!(cache.invalidate_dependency(&app), 1);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_watched_dependency_change_evicts_entry() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("app.jsx");
        std::fs::write(&file, "<div />").unwrap();

        let cache = MemoryCache::with_file_watching();
        cache.set("a", item("one"), Duration::ZERO, &[file.clone()]);
        assert!(cache.is_watching(&file));

        std::thread::sleep(Duration::from_millis(50));
        std::fs::write(&file, "<span />").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.get("a").is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_insert_purges_expired_entries() {
        let cache = MemoryCache::new();
        for i in 0..1000 {
            cache.set(&format!("stale-{}", i), item("old"), Duration::from_millis(1), &[]);
        }
        std::thread::sleep(Duration::from_millis(50));

        cache.set("fresh", item("new"), Duration::from_secs(60), &[]);
        assert_eq!(cache.len(), 1);
        assert_eq!(code_of(cache.get("fresh")), Some("new".to_string()));
    }

    #[test]
    fn test_insert_keeps_entries_kept_alive_by_reads() {
        let cache = MemoryCache::new();
        cache.set("busy", item("one"), Duration::from_millis(300), &[]);
        cache.set("idle", item("two"), Duration::from_millis(300), &[]);

        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.get("busy").is_some());
        std::thread::sleep(Duration::from_millis(200));

        cache.set("other", item("three"), Duration::ZERO, &[]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("busy").is_some());
        assert!(cache.get("idle").is_none());
    }

    #[test]
    fn test_dropped_entries_release_their_watches() {
        let temp_dir = TempDir::new().unwrap();
        let shared = temp_dir.path().join("shared.jsx");
        let own = temp_dir.path().join("own.jsx");
        std::fs::write(&shared, "<div />").unwrap();
        std::fs::write(&own, "<p />").unwrap();

        let cache = MemoryCache::with_file_watching();
        cache.set(
            "short",
            item("one"),
            Duration::from_millis(1),
            &[shared.clone(), own.clone()],
        );
        cache.set("long", item("two"), Duration::ZERO, &[shared.clone()]);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.purge_expired(), 1);
        assert!(!cache.is_watching(&own));
        assert!(cache.is_watching(&shared));

        cache.remove("long");
        assert!(!cache.is_watching(&shared));
    }
}
