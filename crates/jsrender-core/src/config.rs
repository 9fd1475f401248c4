use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::engine::PoolConfig;
use crate::error::{Error, Result};
use crate::fs::FileSystem;

const DEFAULT_START_ENGINES: usize = 10;
const DEFAULT_MAX_ENGINES: usize = 25;
const DEFAULT_MAX_USAGES_PER_ENGINE: usize = 100;
const DEFAULT_CACHE_SLIDING_EXPIRATION_SECS: u64 = 30 * 60;
const DEFAULT_LARGE_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Render configuration consumed by the engine manager, the transformer and
/// render environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfig {
    /// Share initialised engines between requests through the engine pool (default: true)
    #[serde(default = "default_true")]
    pub reuse_engines: bool,

    /// Engines created when the pool starts (default: 10, capped at maxEngines)
    #[serde(default)]
    pub start_engines: Option<usize>,

    /// Upper bound on live pooled engines (default: 25)
    #[serde(default)]
    pub max_engines: Option<usize>,

    /// Leases before a pooled engine is retired, 0 = unlimited (default: 100)
    #[serde(default)]
    pub max_usages_per_engine: Option<usize>,

    /// Precompile scripts when the engine supports it (default: false)
    #[serde(default)]
    pub allow_precompilation: bool,

    /// Engine factory to use instead of probing the registered candidates
    #[serde(default)]
    pub default_engine_name: Option<String>,

    /// Scripts that need transpiling before they can run
    #[serde(default)]
    pub scripts: Vec<String>,

    /// Scripts executed as-is in every fresh engine
    #[serde(default)]
    pub scripts_without_transform: Vec<String>,

    /// Base rendering library, loaded before any user script
    #[serde(default)]
    pub library_scripts: Vec<String>,

    /// Transpiler implementation, loaded on first transform
    #[serde(default)]
    pub transpiler_scripts: Vec<String>,

    /// Load the transpiler at all (default: true)
    #[serde(default = "default_true")]
    pub load_transpiler: bool,

    /// Render components on the server (default: true)
    #[serde(default = "default_true")]
    pub use_server_side_rendering: bool,

    /// Options object handed to the transpiler
    #[serde(default = "default_transpiler_options")]
    pub transpiler_options: serde_json::Value,

    /// Sliding expiration of in-memory transform results, in seconds (default: 1800)
    #[serde(default = "default_cache_sliding_expiration_secs")]
    pub cache_sliding_expiration_secs: u64,

    /// Stack size of the retry thread used for deep transpiles (default: 16 MiB)
    #[serde(default = "default_large_stack_size")]
    pub large_stack_size: usize,

    /// Extra files whose modification recycles the engine pool
    #[serde(default)]
    pub watch_files: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_transpiler_options() -> serde_json::Value {
    serde_json::json!({ "presets": ["react"] })
}

fn default_cache_sliding_expiration_secs() -> u64 {
    DEFAULT_CACHE_SLIDING_EXPIRATION_SECS
}

fn default_large_stack_size() -> usize {
    DEFAULT_LARGE_STACK_SIZE
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            reuse_engines: true,
            start_engines: None,
            max_engines: None,
            max_usages_per_engine: None,
            allow_precompilation: false,
            default_engine_name: None,
            scripts: Vec::new(),
            scripts_without_transform: Vec::new(),
            library_scripts: Vec::new(),
            transpiler_scripts: Vec::new(),
            load_transpiler: true,
            use_server_side_rendering: true,
            transpiler_options: default_transpiler_options(),
            cache_sliding_expiration_secs: DEFAULT_CACHE_SLIDING_EXPIRATION_SECS,
            large_stack_size: DEFAULT_LARGE_STACK_SIZE,
            watch_files: Vec::new(),
        }
    }
}

/// Command line overrides applied on top of a loaded configuration
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub reuse_engines: Option<bool>,
    pub start_engines: Option<usize>,
    pub max_engines: Option<usize>,
    pub max_usages_per_engine: Option<usize>,
    pub allow_precompilation: Option<bool>,
    pub default_engine_name: Option<String>,
    pub scripts: Vec<String>,
    pub library_scripts: Vec<String>,
    pub transpiler_scripts: Vec<String>,
}

impl RenderConfig {
    /// Load configuration from a JSON or YAML file (chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
        } else {
            serde_json::from_str(&content).map_err(|e| Error::Config(e.to_string()))
        }
    }

    /// Create a default configuration and write it to a file
    pub fn init_file(path: &Path) -> Result<()> {
        let config = RenderConfig::default();
        let json =
            serde_json::to_string_pretty(&config).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Merge CLI overrides into this configuration
    pub fn merge_with_cli(&mut self, overrides: CliOverrides) {
        if let Some(reuse) = overrides.reuse_engines {
            self.reuse_engines = reuse;
        }
        if overrides.start_engines.is_some() {
            self.start_engines = overrides.start_engines;
        }
        if overrides.max_engines.is_some() {
            self.max_engines = overrides.max_engines;
        }
        if overrides.max_usages_per_engine.is_some() {
            self.max_usages_per_engine = overrides.max_usages_per_engine;
        }
        if let Some(allow) = overrides.allow_precompilation {
            self.allow_precompilation = allow;
        }
        if overrides.default_engine_name.is_some() {
            self.default_engine_name = overrides.default_engine_name;
        }
        self.scripts.extend(overrides.scripts);
        self.library_scripts.extend(overrides.library_scripts);
        self.transpiler_scripts.extend(overrides.transpiler_scripts);
    }

    /// Check that the pool sizing makes sense
    pub fn validate(&self) -> Result<()> {
        if self.max_engines() == 0 {
            return Err(Error::Config("maxEngines must be at least 1".to_string()));
        }
        if let Some(start) = self.start_engines {
            if start > self.max_engines() {
                return Err(Error::Config(format!(
                    "startEngines ({}) cannot exceed maxEngines ({})",
                    start,
                    self.max_engines()
                )));
            }
        }
        Ok(())
    }

    /// Explicit `startEngines`, or the default limited to `max_engines()`
    pub fn start_engines(&self) -> usize {
        self.start_engines
            .unwrap_or_else(|| DEFAULT_START_ENGINES.min(self.max_engines()))
    }

    pub fn max_engines(&self) -> usize {
        self.max_engines.unwrap_or(DEFAULT_MAX_ENGINES)
    }

    pub fn max_usages_per_engine(&self) -> usize {
        self.max_usages_per_engine
            .unwrap_or(DEFAULT_MAX_USAGES_PER_ENGINE)
    }

    pub fn cache_sliding_expiration(&self) -> Duration {
        Duration::from_secs(self.cache_sliding_expiration_secs)
    }

    /// Pool settings derived from this configuration. Watch paths are mapped
    /// through `fs`; the initializer and recycle hook are supplied by the
    /// engine manager.
    pub fn pool_config(&self, fs: &dyn FileSystem) -> PoolConfig {
        PoolConfig {
            min_engines: self.start_engines(),
            max_engines: self.max_engines(),
            max_usages_per_engine: self.max_usages_per_engine(),
            watch_paths: self
                .recycle_triggers()
                .iter()
                .map(|file| fs.map_path(file))
                .collect(),
            initializer: None,
            on_recycle: None,
        }
    }

    /// Files whose modification recycles the pool: every configured script
    /// plus `watch_files`.
    pub fn recycle_triggers(&self) -> Vec<String> {
        let files: IndexSet<&String> = self
            .scripts
            .iter()
            .chain(&self.scripts_without_transform)
            .chain(&self.library_scripts)
            .chain(&self.watch_files)
            .collect();
        files.into_iter().cloned().collect()
    }
}
