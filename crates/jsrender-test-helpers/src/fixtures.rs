//! Test fixtures - scripts and temporary projects for testing

use jsrender_core::RenderConfig;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A tiny stand-in for React and ReactDOMServer.
///
/// Elements render to plain tags; `renderToString` marks the root element
/// with `data-reactroot` so tests can tell it from static markup.
pub fn fake_react() -> &'static str {
    r#"var React = {
    createElement: function (type, props) {
        var copy = {};
        if (props) {
            for (var key in props) {
                copy[key] = props[key];
            }
        }
        copy.children = Array.prototype.slice.call(arguments, 2);
        return { type: type, props: copy };
    }
};

var ReactDOMServer = (function () {
    function escape(text) {
        return text.replace(/&/g, '&amp;').replace(/</g, '&lt;').replace(/>/g, '&gt;');
    }

    function render(node) {
        if (node === null || node === undefined || node === false) {
            return '';
        }
        if (typeof node === 'string' || typeof node === 'number') {
            return escape(String(node));
        }
        if (Array.isArray(node)) {
            return node.map(render).join('');
        }
        if (typeof node.type === 'function') {
            return render(node.type(node.props));
        }
        return '<' + node.type + '>' + render(node.props.children) + '</' + node.type + '>';
    }

    return {
        renderToString: function (element) {
            return render(element).replace(/^<(\w+)/, '<$1 data-reactroot=""');
        },
        renderToStaticMarkup: render
    };
})();
"#
}

/// A Babel-standalone shaped transpiler that only understands
/// `<tag>text</tag>`, and emits a line-by-line source map.
pub fn fake_transpiler() -> &'static str {
    r#"var Babel = {
    version: '7.0.0-fake',
    transform: function (code, options) {
        var output = code.replace(/<(\w+)>([^<]*)<\/\1>/g, function (match, tag, text) {
            return "React.createElement('" + tag + "', null, '" + text + "')";
        });
        var lines = output.split('\n');
        var mappings = [];
        for (var i = 0; i < lines.length; i++) {
            mappings.push(i === 0 ? 'AAAA' : 'AACA');
        }
        return {
            code: output,
            map: options.sourceMaps ? {
                version: 3,
                sources: [options.filename],
                names: [],
                mappings: mappings.join(';')
            } : null
        };
    }
};
"#
}

/// JSX component rendering a heading and a greeting
pub fn hello_world_component() -> &'static str {
    r#"function Banner() {
    return <h1>Welcome</h1>;
}

function HelloWorld(props) {
    console.log('rendering', props.name);
    return React.createElement('div', null, Banner(), 'Hello ', props.name);
}
"#
}

/// A component whose render throws
pub fn broken_component() -> &'static str {
    r#"function Broken() {
    return missingFunction();
}
"#
}

/// A script with a syntax error
pub fn syntax_error_script() -> &'static str {
    "function (\n"
}

/// A temporary application directory
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Write a file, creating parent directories
    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative)).unwrap()
    }

    /// Write `config` as `jsrender.json` and return its path
    pub fn write_config(&self, config: &RenderConfig) -> PathBuf {
        self.write(
            "jsrender.json",
            &serde_json::to_string_pretty(config).unwrap(),
        )
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// A project with the fake React, the fake transpiler and the
/// `HelloWorld` component, plus a configuration that loads them
pub fn react_project() -> (TestProject, RenderConfig) {
    let project = TestProject::new();
    project.write("lib/react.js", fake_react());
    project.write("lib/babel.js", fake_transpiler());
    project.write("Scripts/HelloWorld.jsx", hello_world_component());

    let config = RenderConfig {
        library_scripts: vec!["~/lib/react.js".to_string()],
        transpiler_scripts: vec!["~/lib/babel.js".to_string()],
        scripts: vec!["~/Scripts/HelloWorld.jsx".to_string()],
        start_engines: Some(1),
        max_engines: Some(2),
        ..RenderConfig::default()
    };
    (project, config)
}
