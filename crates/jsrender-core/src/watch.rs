use notify::event::EventKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::Result;

/// Minimum time between two notifications for the same file
pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches individual files and reports changes on a background thread.
///
/// Parent directories are watched rather than the files themselves so that
/// editors replacing a file atomically are still noticed.
pub struct FileWatcher {
    watcher: Mutex<RecommendedWatcher>,
    files: Arc<Mutex<FxHashSet<PathBuf>>>,
    /// Requested path to its canonical form
    requested: Mutex<FxHashMap<PathBuf, PathBuf>>,
    directories: Mutex<FxHashSet<PathBuf>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FileWatcher {
    /// Create a watcher calling `on_change` for every modified, created or
    /// removed file that has been passed to [`FileWatcher::watch`].
    pub fn new<F>(on_change: F) -> Result<Self>
    where
        F: Fn(&Path) + Send + 'static,
    {
        let (tx, rx) = channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;

        let files = Arc::new(Mutex::new(FxHashSet::default()));
        let watched = Arc::clone(&files);
        std::thread::Builder::new()
            .name("jsrender-watcher".to_string())
            .spawn(move || dispatch(rx, watched, on_change))?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            files,
            requested: Mutex::new(FxHashMap::default()),
            directories: Mutex::new(FxHashSet::default()),
        })
    }

    /// Start watching `path`. Watching the same file twice is a no-op.
    pub fn watch(&self, path: &Path) -> Result<()> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        {
            let mut files = lock(&self.files);
            if !files.insert(canonical.clone()) {
                return Ok(());
            }
            files.insert(path.to_path_buf());
        }
        lock(&self.requested).insert(path.to_path_buf(), canonical.clone());

        let directory = directory_of(&canonical);
        if lock(&self.directories).insert(directory.clone()) {
            debug!("Watching {:?}", directory);
            lock(&self.watcher).watch(&directory, RecursiveMode::NonRecursive)?;
        }
        Ok(())
    }

    /// Stop reporting changes to `path`. The parent directory is released
    /// once no watched file is left in it.
    pub fn unwatch(&self, path: &Path) {
        let canonical = lock(&self.requested)
            .remove(path)
            .or_else(|| path.canonicalize().ok())
            .unwrap_or_else(|| path.to_path_buf());

        let directory = directory_of(&canonical);
        let directory_in_use = {
            let mut files = lock(&self.files);
            files.remove(path);
            files.remove(&canonical);
            files.iter().any(|file| directory_of(file) == directory)
        };
        if directory_in_use || !lock(&self.directories).remove(&directory) {
            return;
        }

        debug!("No longer watching {:?}", directory);
        if let Err(e) = lock(&self.watcher).unwatch(&directory) {
            debug!("Failed to unwatch {:?}: {}", directory, e);
        }
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        let files = lock(&self.files);
        files.contains(path)
            || path
                .canonicalize()
                .map(|canonical| files.contains(&canonical))
                .unwrap_or(false)
    }
}

fn directory_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => path.to_path_buf(),
    }
}

fn dispatch<F>(rx: Receiver<Event>, files: Arc<Mutex<FxHashSet<PathBuf>>>, on_change: F)
where
    F: Fn(&Path),
{
    let mut last_fired: FxHashMap<PathBuf, Instant> = FxHashMap::default();

    // Ends when the watcher (and with it the sender) is dropped
    while let Ok(event) = rx.recv() {
        if !matches!(
            event.kind,
            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
        ) {
            continue;
        }

        let now = Instant::now();
        last_fired.retain(|_, last| now.duration_since(*last) < DEBOUNCE);

        for path in event.paths {
            let watched = {
                let files = lock(&files);
                files.contains(&path)
                    || path
                        .canonicalize()
                        .map(|canonical| files.contains(&canonical))
                        .unwrap_or(false)
            };
            if !watched {
                continue;
            }

            if !last_fired.contains_key(&path) {
                last_fired.insert(path.clone(), now);
                debug!("Watched file changed: {:?}", path);
                on_change(&path);
            }
        }
    }

    debug!("File watcher stopped");
}

/// Start a watcher, logging instead of failing when the platform refuses.
pub fn try_watch<F>(paths: &[PathBuf], on_change: F) -> Option<FileWatcher>
where
    F: Fn(&Path) + Send + 'static,
{
    let watcher = match FileWatcher::new(on_change) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!("Failed to start file watcher: {}", e);
            return None;
        }
    };
    for path in paths {
        if let Err(e) = watcher.watch(path) {
            warn!("Failed to watch {:?}: {}", path, e);
        }
    }
    Some(watcher)
}
