//! Environment shims for server-side rendering.

/// Makes the engine look enough like a browser/Node global scope for common
/// rendering libraries, and records console calls so they can be replayed
/// on the client.
pub const SHIMS: &str = r#"// jsrender environment shims
var global = global || this;
var self = self || this;
var window = window || this;

(function (root) {
    var history = [];

    function stringify(value) {
        if (typeof value === 'string') {
            return value;
        }
        try {
            return JSON.stringify(value);
        } catch (e) {
            return String(value);
        }
    }

    function record(level) {
        return function () {
            var parts = [];
            for (var i = 0; i < arguments.length; i++) {
                parts.push(stringify(arguments[i]));
            }
            history.push({ level: level, message: parts.join(' ') });
        };
    }

    root.console = {
        log: record('log'),
        info: record('info'),
        warn: record('warn'),
        error: record('error'),
        debug: record('debug'),
        history: history,
        clearHistory: function () {
            history.length = 0;
        }
    };
})(global);

function __jsrenderConsoleHistory() {
    var entries = console.history.slice(0);
    console.clearHistory();
    return entries;
}

function __jsrenderRenderComponent(name, props, staticMarkup) {
    var component = global;
    var parts = name.split('.');
    for (var i = 0; i < parts.length; i++) {
        component = component == null ? undefined : component[parts[i]];
    }
    if (component === undefined) {
        throw new ReferenceError('Could not find a component named "' + name + '"');
    }
    var element = React.createElement(component, props);
    return staticMarkup
        ? ReactDOMServer.renderToStaticMarkup(element)
        : ReactDOMServer.renderToString(element);
}
"#;

/// Name of the function returning (and clearing) the recorded console calls.
pub const CONSOLE_HISTORY_FUNCTION: &str = "__jsrenderConsoleHistory";

/// Renders a component (looked up by dotted global path) to HTML:
/// `(name, props, staticMarkup) -> string`.
pub const RENDER_COMPONENT_FUNCTION: &str = "__jsrenderRenderComponent";
