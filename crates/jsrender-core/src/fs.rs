use rustc_hash::FxHashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// File access used by the engine manager and the transformer.
///
/// Script paths in configuration are application-relative (`~/Scripts/app.jsx`
/// or `Scripts/app.jsx`); `map_path` turns them into real paths.
pub trait FileSystem: Send + Sync {
    fn read_text(&self, path: &Path) -> io::Result<String>;

    fn write_text(&self, path: &Path, contents: &str) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn map_path(&self, relative: &str) -> PathBuf;
}

/// File system rooted at an application directory.
#[derive(Debug, Clone)]
pub struct RealFileSystem {
    root: PathBuf,
}

impl RealFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn current_dir() -> io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileSystem for RealFileSystem {
    fn read_text(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_text(&self, path: &Path, contents: &str) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, contents)
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn map_path(&self, relative: &str) -> PathBuf {
        map_relative(&self.root, relative)
    }
}

/// In-memory file system for tests
#[derive(Debug, Clone)]
pub struct MockFileSystem {
    root: PathBuf,
    files: Arc<Mutex<FxHashMap<PathBuf, String>>>,
}

impl Default for MockFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::with_root("/app")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Add or replace a file. Relative paths are mapped against the root.
    pub fn add_file(&self, path: &str, contents: impl Into<String>) {
        let path = map_relative(&self.root, path);
        self.lock().insert(path, contents.into());
    }

    pub fn remove_file(&self, path: &str) {
        let path = map_relative(&self.root, path);
        self.lock().remove(&path);
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        self.lock().get(path).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<PathBuf, String>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileSystem for MockFileSystem {
    fn read_text(&self, path: &Path) -> io::Result<String> {
        self.lock().get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {}", path.display()),
            )
        })
    }

    fn write_text(&self, path: &Path, contents: &str) -> io::Result<()> {
        self.lock().insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    fn map_path(&self, relative: &str) -> PathBuf {
        map_relative(&self.root, relative)
    }
}

fn map_relative(root: &Path, relative: &str) -> PathBuf {
    let trimmed = relative
        .strip_prefix("~/")
        .or_else(|| relative.strip_prefix("~\\"))
        .unwrap_or(relative);
    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    }
}
