//! Transpiler glue.

/// Adapts a transpiler exposing a Babel-standalone style global
/// (`Babel.transform(source, options)` returning `{ code, map }`) to the two
/// functions jsrender calls. The transpiler itself is supplied by the
/// embedder through `transpilerScripts`.
pub const TRANSFORM_GLUE: &str = r#"// jsrender transpiler glue
function __jsrenderTranspilerOptions(options, filename, sourceMaps) {
    var merged = {};
    if (options) {
        for (var key in options) {
            if (Object.prototype.hasOwnProperty.call(options, key)) {
                merged[key] = options[key];
            }
        }
    }
    merged.filename = filename;
    merged.sourceMaps = sourceMaps;
    return merged;
}

function JsRender_transform(input, options, filename) {
    if (typeof Babel === 'undefined' || typeof Babel.transform !== 'function') {
        throw new Error('No transpiler has been loaded. Configure transpilerScripts.');
    }
    return Babel.transform(input, __jsrenderTranspilerOptions(options, filename, false)).code;
}

function JsRender_transform_sourcemap(input, options, filename) {
    if (typeof Babel === 'undefined' || typeof Babel.transform !== 'function') {
        throw new Error('No transpiler has been loaded. Configure transpilerScripts.');
    }
    var result = Babel.transform(input, __jsrenderTranspilerOptions(options, filename, true));
    return {
        code: result.code,
        sourceMap: result.map || null
    };
}

function JsRender_transpiler_version() {
    return (typeof Babel !== 'undefined' && Babel.version) ? String(Babel.version) : 'unknown';
}
"#;

/// Transpiles without a source map.
pub const TRANSFORM_FUNCTION: &str = "JsRender_transform";

/// Transpiles and returns `{ code, sourceMap }`.
pub const TRANSFORM_WITH_SOURCE_MAP_FUNCTION: &str = "JsRender_transform_sourcemap";

/// Reports the version string of the loaded transpiler.
pub const TRANSPILER_VERSION_FUNCTION: &str = "JsRender_transpiler_version";
