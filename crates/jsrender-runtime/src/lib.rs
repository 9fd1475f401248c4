//! Bootstrap JavaScript for jsrender engines.
//! Provides JavaScript snippets embedded as constants and loaded into every
//! fresh engine before any user code runs.

pub mod shims;
pub mod transform;

/// Resource name of the environment shims.
pub const SHIMS_RESOURCE: &str = "shims.js";

/// Resource name of the transpiler glue.
pub const TRANSFORM_RESOURCE: &str = "transform.js";

/// Look up an embedded resource by name.
pub fn resource(name: &str) -> Option<&'static str> {
    match name {
        SHIMS_RESOURCE => Some(shims::SHIMS),
        TRANSFORM_RESOURCE => Some(transform::TRANSFORM_GLUE),
        _ => None,
    }
}
