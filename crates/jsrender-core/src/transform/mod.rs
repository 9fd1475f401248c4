//! Transpiling scripts before they run
//!
//! Results are cached in two tiers: the in-memory [`ArtifactCache`] and a
//! `.generated.js` file next to each source, whose first line carries the
//! hash of the source it was produced from.
//!
//! [`ArtifactCache`]: crate::cache::ArtifactCache

mod transformer;

pub use transformer::{Transformer, CACHE_KEY_VERSION, HEADER_LINES};

use serde::Deserialize;

use crate::sourcemap::SourceMap;

/// A transpiled script
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    /// Generated code, including the header
    pub code: String,
    pub source_map: Option<SourceMap>,
    /// Hash of the source the code was generated from
    pub hash: String,
    pub transpiler_version: String,
}

/// What the transpiler glue returns when a source map is requested
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranspileOutput {
    code: String,
    #[serde(default)]
    source_map: Option<SourceMap>,
}
