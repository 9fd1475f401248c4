use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use jsrender_runtime::transform::{
    TRANSFORM_FUNCTION, TRANSFORM_WITH_SOURCE_MAP_FUNCTION, TRANSPILER_VERSION_FUNCTION,
};

use super::{TransformResult, TranspileOutput};
use crate::cache::{ArtifactCache, CacheItem};
use crate::config::RenderConfig;
use crate::engine::EngineManager;
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::hash::HashValidator;
use crate::sourcemap::SourceMap;

/// Bump to invalidate every in-memory transform result at once
pub const CACHE_KEY_VERSION: u32 = 3;

/// Lines in the header prepended to generated code
pub const HEADER_LINES: usize = 5;

const SOURCE_MAPPING_COMMENT: &str = "//# sourceMappingURL=";
const VERSION_LINE_PREFIX: &str = "// Version: ";
const TRANSPILER_SEPARATOR: &str = ", transpiler ";
const UNKNOWN_VERSION: &str = "unknown";

/// Transpiles scripts through the engine manager's non-pooled engines,
/// caching results in memory and next to the source file.
pub struct Transformer {
    manager: Arc<EngineManager>,
    cache: Arc<dyn ArtifactCache>,
    fs: Arc<dyn FileSystem>,
    config: Arc<RenderConfig>,
    validator: HashValidator,
    transpiler_version: Mutex<Option<String>>,
}

impl Transformer {
    pub fn new(
        manager: Arc<EngineManager>,
        cache: Arc<dyn ArtifactCache>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let config = Arc::clone(manager.config());
        Self {
            manager,
            cache,
            fs,
            config,
            validator: HashValidator::new(),
            transpiler_version: Mutex::new(None),
        }
    }

    /// In-memory cache key of the transform result for `path`
    pub fn cache_key(path: &Path) -> String {
        format!("TRANSFORM_v{}_{}", CACHE_KEY_VERSION, path.display())
    }

    /// `app.jsx` becomes `app.generated.js` in the same directory
    pub fn output_path(path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{}.generated.js", stem))
    }

    pub fn source_map_output_path(path: &Path) -> PathBuf {
        let mut output = Self::output_path(path).into_os_string();
        output.push(".map");
        PathBuf::from(output)
    }

    /// Transpile an application file, returning only the code
    pub fn transform_file(&self, filename: &str) -> Result<String> {
        self.transform_file_with_source_map(filename, false)
            .map(|result| result.code.clone())
    }

    /// Transpile an application file.
    ///
    /// Looks in the in-memory cache, then at the `.generated.js` file on
    /// disk, and only transpiles when neither is current. With
    /// `force_generate_source_map` a result known to lack a source map is
    /// never returned.
    pub fn transform_file_with_source_map(
        &self,
        filename: &str,
        force_generate_source_map: bool,
    ) -> Result<Arc<TransformResult>> {
        let path = self.fs.map_path(filename);
        let key = Self::cache_key(&path);

        if let Some(item) = self.cache.get(&key) {
            if let Some(cached) = item.as_transform() {
                if !force_generate_source_map || cached.source_map.is_some() {
                    debug!("Transform cache hit for {}", filename);
                    return Ok(Arc::clone(cached));
                }
            }
        }

        let contents = self.fs.read_text(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound(path.clone()),
            _ => Error::Io(e),
        })?;
        let hash = self.validator.calculate_hash(&contents);

        let result = match self.load_from_disk(&path, &hash, force_generate_source_map) {
            Some(result) => result,
            None => {
                debug!("Transpiling {}", filename);
                self.transform_live(&contents, filename, &path, hash, force_generate_source_map)?
            }
        };

        let result = Arc::new(result);
        self.cache.set(
            &key,
            CacheItem::Transform(Arc::clone(&result)),
            self.config.cache_sliding_expiration(),
            &[path],
        );
        Ok(result)
    }

    /// Transpile source code that does not come from a file. Nothing is
    /// cached.
    pub fn transform(&self, input: &str, filename: Option<&str>) -> Result<String> {
        let filename = filename.unwrap_or("unknown");
        let args = [
            Value::from(input),
            self.config.transpiler_options.clone(),
            Value::from(filename),
        ];
        self.call(TRANSFORM_FUNCTION, filename, &args)
    }

    /// Transpile a file and write `{name}.generated.js` (and its source map)
    /// next to it. Returns the path of the generated file.
    pub fn transform_and_save_file(&self, filename: &str, inline_source_map: bool) -> Result<PathBuf> {
        let path = self.fs.map_path(filename);
        let result = self.transform_file_with_source_map(filename, true)?;
        let output = Self::output_path(&path);

        let mut code = strip_source_mapping_comment(&result.code).to_string();
        if let Some(map) = &result.source_map {
            if inline_source_map {
                code.push('\n');
                code.push_str(&map.to_comment()?);
            } else {
                let map_path = Self::source_map_output_path(&path);
                self.fs.write_text(&map_path, &map.to_json()?)?;
                let map_name = map_path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                code.push('\n');
                code.push_str(SOURCE_MAPPING_COMMENT);
                code.push_str(&map_name);
            }
        }

        self.fs.write_text(&output, &code)?;
        debug!("Wrote {:?}", output);
        Ok(output)
    }

    fn load_from_disk(&self, path: &Path, hash: &str, force: bool) -> Option<TransformResult> {
        let output = Self::output_path(path);
        if !self.fs.exists(&output) {
            return None;
        }

        let cached = match self.fs.read_text(&output) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Failed to read {:?}: {}", output, e);
                return None;
            }
        };
        if !self.validator.validate_hash(&cached, hash) {
            debug!("{:?} is out of date", output);
            return None;
        }

        let map_path = Self::source_map_output_path(path);
        let source_map = if self.fs.exists(&map_path) {
            let parsed = self
                .fs
                .read_text(&map_path)
                .map_err(|e| e.to_string())
                .and_then(|json| SourceMap::from_json(&json).map_err(|e| e.to_string()));
            match parsed {
                Ok(map) => Some(map),
                Err(e) => {
                    warn!("Ignoring unreadable source map {:?}: {}", map_path, e);
                    None
                }
            }
        } else {
            None
        };

        if force && source_map.is_none() {
            return None;
        }

        debug!("Using {:?}", output);
        Some(TransformResult {
            code: strip_source_mapping_comment(&cached).to_string(),
            source_map,
            hash: hash.to_string(),
            transpiler_version: transpiler_version_of(&cached),
        })
    }

    fn transform_live(
        &self,
        contents: &str,
        filename: &str,
        path: &Path,
        hash: String,
        with_source_map: bool,
    ) -> Result<TransformResult> {
        let source_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        let args = [
            Value::from(contents),
            self.config.transpiler_options.clone(),
            Value::from(source_name.as_str()),
        ];

        let (code, source_map) = if with_source_map {
            let output: TranspileOutput =
                self.call(TRANSFORM_WITH_SOURCE_MAP_FUNCTION, filename, &args)?;
            (output.code, output.source_map)
        } else {
            (self.call::<String>(TRANSFORM_FUNCTION, filename, &args)?, None)
        };

        let transpiler_version = self.transpiler_version();
        let source_map = source_map.map(|mut map| {
            map.shift_lines(HEADER_LINES);
            map.embed_single_source(source_name.as_str(), contents);
            map.file = Self::output_path(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            map
        });

        Ok(TransformResult {
            code: format!(
                "{}{}",
                self.header(&hash, filename, &transpiler_version),
                code
            ),
            source_map,
            hash,
            transpiler_version,
        })
    }

    fn header(&self, hash: &str, filename: &str, transpiler_version: &str) -> String {
        format!(
            "{}\n\
             // Automatically generated by jsrender. Do not edit, your changes will be overridden.\n\
             {}jsrender {}{}{}\n\
             // Source: {}\n\
             {}\n",
            self.validator.header_line(hash),
            VERSION_LINE_PREFIX,
            env!("CARGO_PKG_VERSION"),
            TRANSPILER_SEPARATOR,
            transpiler_version,
            filename,
            "/".repeat(80)
        )
    }

    fn transpiler_version(&self) -> String {
        let mut version = self
            .transpiler_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(version) = version.as_ref() {
            return version.clone();
        }
        let detected = match self
            .manager
            .execute_with_larger_stack_if_required::<String>(TRANSPILER_VERSION_FUNCTION, &[])
        {
            Ok(detected) => detected,
            Err(e) => {
                warn!("Could not determine the transpiler version: {}", e);
                UNKNOWN_VERSION.to_string()
            }
        };
        *version = Some(detected.clone());
        detected
    }

    fn call<T: DeserializeOwned>(&self, function: &str, filename: &str, args: &[Value]) -> Result<T> {
        self.manager
            .execute_with_larger_stack_if_required(function, args)
            .map_err(|e| match e {
                Error::Engine(source) => Error::Transform {
                    file: filename.to_string(),
                    source,
                },
                other => other,
            })
    }
}

fn strip_source_mapping_comment(code: &str) -> &str {
    let trimmed = code.trim_end();
    let (head, last) = match trimmed.rfind('\n') {
        Some(index) => (&trimmed[..index], &trimmed[index + 1..]),
        None => ("", trimmed),
    };
    if last.starts_with(SOURCE_MAPPING_COMMENT) {
        head
    } else {
        code
    }
}

fn transpiler_version_of(generated: &str) -> String {
    generated
        .lines()
        .nth(2)
        .and_then(|line| line.strip_prefix(VERSION_LINE_PREFIX))
        .and_then(|line| line.split_once(TRANSPILER_SEPARATOR))
        .map(|(_, version)| version.trim().to_string())
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}
