//! Per-request rendering on top of the engine manager
//!
//! A [`RenderEnvironment`] holds one engine for its lifetime. User scripts
//! are transpiled and loaded into that engine on first use; an engine that
//! already has them (a reused pool engine) is not loaded twice.

mod component;

pub use component::{validate_name, Component, ComponentOptions};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, PoisonError};
use tracing::{debug, warn};

use jsrender_runtime::shims::{CONSOLE_HISTORY_FUNCTION, RENDER_COMPONENT_FUNCTION};

use crate::config::RenderConfig;
use crate::engine::{Engine, EngineError, EngineLease, EngineManager};
use crate::error::{Error, Result};
use crate::transform::Transformer;

/// Engine variable marking that the user scripts have been loaded
pub const USER_SCRIPTS_LOADED_VARIABLE: &str = "__jsrenderUserScriptsLoaded";

const INLINE_DOCUMENT: &str = "<inline>";

/// Called with the error, the component name and the container id when a
/// component fails to render. The component then renders as an empty
/// container.
pub type ExceptionHandler = Arc<dyn Fn(&Error, &str, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    Created,
    ScriptsLoading,
    Ready,
    Disposed,
}

/// A console call recorded by the shims
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsoleEntry {
    pub level: String,
    pub message: String,
}

pub struct RenderEnvironment {
    manager: Arc<EngineManager>,
    transformer: Arc<Transformer>,
    config: Arc<RenderConfig>,
    engine: Option<EngineLease>,
    state: EnvironmentState,
    components: Vec<Component>,
    exception_handler: Option<ExceptionHandler>,
}

impl RenderEnvironment {
    pub fn new(manager: Arc<EngineManager>, transformer: Arc<Transformer>) -> Self {
        let config = Arc::clone(manager.config());
        Self {
            manager,
            transformer,
            config,
            engine: None,
            state: EnvironmentState::Created,
            components: Vec::new(),
            exception_handler: None,
        }
    }

    pub fn with_exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    pub fn set_exception_handler(&mut self, handler: Option<ExceptionHandler>) {
        self.exception_handler = handler;
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    pub fn engine_name(&self) -> &str {
        self.manager.engine_name()
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    fn lease(&mut self) -> Result<&mut EngineLease> {
        if self.state == EnvironmentState::Disposed {
            return Err(Error::EnvironmentDisposed);
        }
        let lease = match self.engine.take() {
            Some(lease) => lease,
            None => self.manager.get_engine()?,
        };
        Ok(self.engine.insert(lease))
    }

    fn with_engine<R>(
        &mut self,
        f: impl FnOnce(&mut dyn Engine) -> std::result::Result<R, EngineError>,
    ) -> Result<R> {
        Ok(self.lease()?.with(f)?)
    }

    /// Transpile and execute the configured application scripts, unless the
    /// engine already ran them.
    ///
    /// Transpiling happens outside the engine lock: without engine reuse the
    /// transformer runs on this thread's engine too.
    pub fn ensure_user_scripts_loaded(&mut self) -> Result<()> {
        if self.state == EnvironmentState::Ready {
            return Ok(());
        }
        if self.with_engine(|engine| engine.has_variable(USER_SCRIPTS_LOADED_VARIABLE))? {
            self.state = EnvironmentState::Ready;
            return Ok(());
        }

        self.state = EnvironmentState::ScriptsLoading;
        if let Err(e) = self.load_user_scripts() {
            // The engine may hold part of the scripts without the sentinel
            self.discard_engine();
            self.state = EnvironmentState::Created;
            return Err(e);
        }
        self.state = EnvironmentState::Ready;
        Ok(())
    }

    fn load_user_scripts(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);
        let transformer = Arc::clone(&self.transformer);
        for file in &config.scripts {
            let code = transformer
                .transform_file(file)
                .map_err(|e| e.into_script_load(file))?;
            self.with_engine(|engine| engine.execute(&code, file))
                .map_err(|e| e.into_script_load(file))?;
        }
        self.with_engine(|engine| {
            engine.set_variable(USER_SCRIPTS_LOADED_VARIABLE, Value::Bool(true))
        })?;

        debug!("Loaded {} user scripts", config.scripts.len());
        Ok(())
    }

    /// Dispose the held engine instead of returning it for reuse
    fn discard_engine(&mut self) {
        match self.engine.take() {
            Some(EngineLease::Pooled(engine)) => {
                debug!("Discarding pooled engine {}", engine.id());
                engine.discard();
            }
            Some(EngineLease::ThreadLocal(shared)) => {
                shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .dispose();
            }
            None => {}
        }
    }

    fn run<R>(
        &mut self,
        f: impl FnOnce(&mut dyn Engine) -> std::result::Result<R, EngineError>,
    ) -> Result<R> {
        self.ensure_user_scripts_loaded()?;
        self.with_engine(f).map_err(Error::into_runtime_execution)
    }

    pub fn execute(&mut self, code: &str) -> Result<()> {
        self.run(|engine| engine.execute(code, INLINE_DOCUMENT))
    }

    pub fn execute_with_result<T: DeserializeOwned>(&mut self, code: &str) -> Result<T> {
        let value = self.run(|engine| engine.evaluate(code))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn call_function<T: DeserializeOwned>(&mut self, name: &str, args: &[Value]) -> Result<T> {
        let value = self.run(|engine| engine.call_function(name, args))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn has_variable(&mut self, name: &str) -> Result<bool> {
        self.run(|engine| engine.has_variable(name))
    }

    /// Register a component to be rendered in this environment
    pub fn create_component(
        &mut self,
        name: &str,
        props: Value,
        options: ComponentOptions,
    ) -> Result<Component> {
        if self.state == EnvironmentState::Disposed {
            return Err(Error::EnvironmentDisposed);
        }
        let component = Component::new(name, props, options)?;
        self.components.push(component.clone());
        Ok(component)
    }

    /// Render a component to HTML wrapped in its container.
    ///
    /// Client-only components, and every component when server-side
    /// rendering is off, render as an empty container.
    pub fn render_component(&mut self, component: &Component) -> Result<String> {
        if component.client_only || !self.config.use_server_side_rendering {
            return Ok(component.wrap(""));
        }
        self.ensure_user_scripts_loaded()?;

        let args = [
            Value::from(component.name.as_str()),
            component.props.clone(),
            Value::Bool(component.server_only),
        ];
        let rendered = self
            .run(|engine| engine.call_function(RENDER_COMPONENT_FUNCTION, &args))
            .and_then(|value| match value {
                Value::String(html) => Ok(html),
                other => Err(Error::RuntimeExecution {
                    message: format!(
                        "Rendering {} returned {} instead of a string",
                        component.name, other
                    ),
                    line: None,
                    column: None,
                }),
            });
        let html = match rendered {
            Ok(html) => html,
            Err(e) => match &self.exception_handler {
                Some(handler) => {
                    warn!("Rendering {} failed: {}", component.name, e);
                    handler(&e, &component.name, &component.container_id);
                    String::new()
                }
                None => return Err(e),
            },
        };
        Ok(component.wrap(&html))
    }

    /// Client script for one component
    pub fn render_javascript(&self, component: &Component) -> Result<String> {
        component.render_javascript()
    }

    /// Client script for every registered component, preceded by a replay
    /// of the console calls made while rendering
    pub fn get_init_javascript(&mut self) -> Result<String> {
        let mut script = String::new();
        if self.engine.is_some() {
            for entry in self.console_output()? {
                script.push_str(&format!(
                    "console.{}({});\n",
                    console_method(&entry.level),
                    serde_json::to_string(&format!("[Server] {}", entry.message))?
                ));
            }
        }
        for component in self.components.iter().filter(|c| !c.server_only) {
            script.push_str(&component.render_javascript()?);
            script.push_str(";\n");
        }
        Ok(script)
    }

    /// Console calls recorded since the last read
    pub fn console_output(&mut self) -> Result<Vec<ConsoleEntry>> {
        self.call_function(CONSOLE_HISTORY_FUNCTION, &[])
    }

    /// Give the engine back: pooled engines return to the pool, a
    /// thread-local engine is disposed.
    pub fn dispose(&mut self) {
        if self.state == EnvironmentState::Disposed {
            return;
        }
        self.state = EnvironmentState::Disposed;
        match self.engine.take() {
            Some(lease @ EngineLease::Pooled(_)) => self.manager.return_engine_to_pool(lease),
            Some(EngineLease::ThreadLocal(shared)) => {
                shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .dispose();
            }
            None => {}
        }
    }
}

impl Drop for RenderEnvironment {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn console_method(level: &str) -> &str {
    match level {
        "info" | "warn" | "error" | "debug" => level,
        _ => "log",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::engine::mock::MockEngineFactory;
    use crate::engine::{EngineRegistry, ScriptError};
    use crate::fs::{FileSystem, MockFileSystem};
    use crate::transform::HEADER_LINES;
    use jsrender_runtime::transform::{TRANSFORM_FUNCTION, TRANSPILER_VERSION_FUNCTION};
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        factory: MockEngineFactory,
        manager: Arc<EngineManager>,
        transformer: Arc<Transformer>,
    }

    impl Fixture {
        fn new(config: RenderConfig, factory: MockEngineFactory, fs: &MockFileSystem) -> Self {
            let mut registry = EngineRegistry::new();
            registry.register(factory.clone());
            let fs: Arc<dyn FileSystem> = Arc::new(fs.clone());
            let cache = Arc::new(MemoryCache::new());
            let manager = Arc::new(
                EngineManager::new(Arc::new(config), registry, Arc::clone(&fs), cache.clone())
                    .unwrap(),
            );
            let transformer = Arc::new(Transformer::new(Arc::clone(&manager), cache, fs));
            Self {
                factory,
                manager,
                transformer,
            }
        }

        fn environment(&self) -> RenderEnvironment {
            RenderEnvironment::new(Arc::clone(&self.manager), Arc::clone(&self.transformer))
        }
    }

    fn renderer() -> MockEngineFactory {
        MockEngineFactory::new("mock")
            .with_function(TRANSFORM_FUNCTION, |args| Ok(args[0].clone()))
            .with_function(TRANSPILER_VERSION_FUNCTION, |_| Ok(Value::from("7.0.0")))
            .with_function(RENDER_COMPONENT_FUNCTION, |args| {
                let tag = if args[2] == Value::Bool(true) { "p" } else { "div" };
                Ok(Value::from(format!(
                    "<{tag}>{}</{tag}>",
                    args[1]["text"].as_str().unwrap_or_default()
                )))
            })
            .with_function(CONSOLE_HISTORY_FUNCTION, |_| {
                Ok(json!([{ "level": "warn", "message": "careful" }]))
            })
    }

    fn app_config() -> RenderConfig {
        RenderConfig {
            scripts: vec!["~/Scripts/app.jsx".to_string()],
            start_engines: Some(1),
            max_engines: Some(1),
            ..RenderConfig::default()
        }
    }

    fn app_fs() -> MockFileSystem {
        let fs = MockFileSystem::new();
        fs.add_file("~/Scripts/app.jsx", "function App() {}");
        fs
    }

    #[test]
    fn test_user_scripts_load_once_per_engine() {
        let fs = app_fs();
        let fixture = Fixture::new(app_config(), renderer(), &fs);

        let mut first = fixture.environment();
        assert_eq!(first.state(), EnvironmentState::Created);
        first.ensure_user_scripts_loaded().unwrap();
        first.ensure_user_scripts_loaded().unwrap();
        assert_eq!(first.state(), EnvironmentState::Ready);
        first.dispose();

        // Same pooled engine: the sentinel is already set
        let mut second = fixture.environment();
        second.ensure_user_scripts_loaded().unwrap();
        assert_eq!(fixture.factory.execution_count("~/Scripts/app.jsx"), 1);
    }

    #[test]
    fn test_script_error_reports_file_and_position() {
        let fs = MockFileSystem::new();
        fs.add_file("~/Scripts/app.jsx", "var a = 1;\n  throw 'bad';");
        let fixture = Fixture::new(app_config(), renderer(), &fs);

        match fixture.environment().ensure_user_scripts_loaded() {
            Err(Error::ScriptLoad {
                file,
                message,
                line,
                column,
            }) => {
                assert_eq!(file, "~/Scripts/app.jsx");
                assert_eq!(message, "bad");
                // Positions refer to the generated code, after its header
                let line_in_generated = HEADER_LINES as u32 + 2;
                assert_eq!((line, column), (Some(line_in_generated), Some(3)));
            }
            other => panic!("expected a script load error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_missing_script_is_a_load_error() {
        let fixture = Fixture::new(app_config(), renderer(), &MockFileSystem::new());
        assert!(matches!(
            fixture.environment().ensure_user_scripts_loaded(),
            Err(Error::ScriptLoad { .. })
        ));
    }

    #[test]
    fn test_render_component() {
        let fs = app_fs();
        let fixture = Fixture::new(app_config(), renderer(), &fs);
        let mut env = fixture.environment();

        let component = env
            .create_component(
                "App",
                json!({ "text": "hi" }),
                ComponentOptions {
                    container_id: Some("root".to_string()),
                    ..ComponentOptions::default()
                },
            )
            .unwrap();
        assert_eq!(
            env.render_component(&component).unwrap(),
            "<div id=\"root\"><div>hi</div></div>"
        );
        assert_eq!(env.components().len(), 1);
    }

    #[test]
    fn test_server_only_renders_static_markup() {
        let fs = app_fs();
        let fixture = Fixture::new(app_config(), renderer(), &fs);
        let mut env = fixture.environment();
        let options = ComponentOptions {
            container_id: Some("root".to_string()),
            server_only: true,
            ..ComponentOptions::default()
        };
        let component = env
            .create_component("App", json!({ "text": "x" }), options)
            .unwrap();
        assert_eq!(
            env.render_component(&component).unwrap(),
            "<div id=\"root\"><p>x</p></div>"
        );
        assert!(!env.get_init_javascript().unwrap().contains("ReactDOM"));
    }

    #[test]
    fn test_client_only_skips_the_engine() {
        let fixture = Fixture::new(app_config(), renderer(), &MockFileSystem::new());
        let mut env = fixture.environment();
        let options = ComponentOptions {
            container_id: Some("root".to_string()),
            client_only: true,
            ..ComponentOptions::default()
        };
        let component = env.create_component("App", json!({}), options).unwrap();

        // The missing user script is never loaded
        assert_eq!(env.render_component(&component).unwrap(), "<div id=\"root\"></div>");
        assert_eq!(env.state(), EnvironmentState::Created);
    }

    #[test]
    fn test_render_error_is_runtime_execution() {
        let fs = app_fs();
        let factory = renderer();
        factory.set_function(RENDER_COMPONENT_FUNCTION, |_| {
            Err(EngineError::Script(ScriptError::new("TypeError: x is undefined").at(7, 3)))
        });
        let fixture = Fixture::new(app_config(), factory, &fs);
        let mut env = fixture.environment();
        let component = env
            .create_component("App", json!({}), ComponentOptions::default())
            .unwrap();

        match env.render_component(&component) {
            Err(err @ Error::RuntimeExecution { .. }) => {
                assert_eq!(
                    err.to_string(),
                    "TypeError: x is undefined (at line 7, column 3)"
                );
            }
            other => panic!("expected a runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_exception_handler_degrades_to_empty_container() {
        let fs = app_fs();
        let factory = renderer();
        factory.set_function(RENDER_COMPONENT_FUNCTION, |_| {
            Err(EngineError::Script(ScriptError::new("boom")))
        });
        let fixture = Fixture::new(app_config(), factory, &fs);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let mut env = fixture
            .environment()
            .with_exception_handler(Arc::new(move |err: &Error, name: &str, id: &str| {
                recorder
                    .lock()
                    .unwrap()
                    .push(format!("{} {} {}", name, id, err));
            }));
        let options = ComponentOptions {
            container_id: Some("root".to_string()),
            ..ComponentOptions::default()
        };
        let component = env.create_component("App", json!({}), options).unwrap();

        assert_eq!(env.render_component(&component).unwrap(), "<div id=\"root\"></div>");
        assert_eq!(seen.lock().unwrap().as_slice(), ["App root boom"]);
    }

    #[test]
    fn test_non_string_render_result_reaches_exception_handler() {
        let fs = app_fs();
        let factory = renderer();
        factory.set_function(RENDER_COMPONENT_FUNCTION, |_| Ok(json!({ "html": 1 })));
        let fixture = Fixture::new(app_config(), factory, &fs);

        let mut env = fixture.environment();
        let component = env
            .create_component("App", json!({}), ComponentOptions::default())
            .unwrap();
        assert!(matches!(
            env.render_component(&component),
            Err(Error::RuntimeExecution { .. })
        ));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        env.set_exception_handler(Some(Arc::new(move |err: &Error, name: &str, _id: &str| {
            recorder.lock().unwrap().push(format!("{}: {}", name, err));
        })));
        let html = env.render_component(&component).unwrap();
        assert_eq!(html, component.wrap(""));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["App: Rendering App returned {\"html\":1} instead of a string"]
        );
    }

    #[test]
    fn test_failed_script_load_discards_engine() {
        let fs = MockFileSystem::new();
        fs.add_file("~/Scripts/a.jsx", "var a = 1;");
        fs.add_file("~/Scripts/b.jsx", "throw 'half-written';");
        let config = RenderConfig {
            scripts: vec!["~/Scripts/a.jsx".to_string(), "~/Scripts/b.jsx".to_string()],
            ..app_config()
        };
        let fixture = Fixture::new(config, renderer(), &fs);
        let pool = Arc::clone(fixture.manager.pool().unwrap());
        let disposed = fixture.factory.disposed();

        let mut env = fixture.environment();
        assert!(matches!(
            env.ensure_user_scripts_loaded(),
            Err(Error::ScriptLoad { .. })
        ));
        assert_eq!(env.state(), EnvironmentState::Created);

        // The half-loaded engine is gone instead of back in the pool
        assert_eq!(fixture.factory.disposed(), disposed + 1);
        assert_eq!(pool.stats().live, 0);

        let created = fixture.factory.created();
        assert!(env.ensure_user_scripts_loaded().is_err());
        assert_eq!(fixture.factory.created(), created + 1);
        assert_eq!(fixture.factory.execution_count("~/Scripts/a.jsx"), 2);
    }

    #[test]
    fn test_invalid_component_name() {
        let fixture = Fixture::new(app_config(), renderer(), &app_fs());
        let mut env = fixture.environment();
        assert!(matches!(
            env.create_component("alert(1)", json!({}), ComponentOptions::default()),
            Err(Error::InvalidComponentName(_))
        ));
    }

    #[test]
    fn test_init_javascript_replays_console() {
        let fs = app_fs();
        let fixture = Fixture::new(app_config(), renderer(), &fs);
        let mut env = fixture.environment();
        let options = ComponentOptions {
            container_id: Some("root".to_string()),
            ..ComponentOptions::default()
        };
        let component = env
            .create_component("App", json!({ "text": "hi" }), options)
            .unwrap();
        env.render_component(&component).unwrap();

        let script = env.get_init_javascript().unwrap();
        assert_eq!(
            script,
            "console.warn(\"[Server] careful\");\n\
             ReactDOM.hydrate(React.createElement(App, {\"text\":\"hi\"}), document.getElementById(\"root\"));\n"
        );
    }

    #[test]
    fn test_execute_and_query() {
        let fixture = Fixture::new(
            app_config(),
            renderer().with_expression("answer", json!(42)),
            &app_fs(),
        );
        let mut env = fixture.environment();
        env.execute("var a = 1;").unwrap();
        assert_eq!(env.execute_with_result::<u32>("answer").unwrap(), 42);
        assert!(env.has_variable(USER_SCRIPTS_LOADED_VARIABLE).unwrap());
        assert!(matches!(
            env.execute("throw 'nope'"),
            Err(Error::RuntimeExecution { .. })
        ));
    }

    #[test]
    fn test_dispose_returns_pooled_engine() {
        let fixture = Fixture::new(app_config(), renderer(), &app_fs());
        let pool = Arc::clone(fixture.manager.pool().unwrap());

        let mut env = fixture.environment();
        env.ensure_user_scripts_loaded().unwrap();
        assert_eq!(pool.stats().in_use, 1);

        env.dispose();
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(env.state(), EnvironmentState::Disposed);
        assert!(matches!(env.execute("1"), Err(Error::EnvironmentDisposed)));
    }

    #[test]
    fn test_dispose_disposes_thread_local_engine() {
        let config = RenderConfig {
            reuse_engines: false,
            ..app_config()
        };
        let fixture = Fixture::new(config, renderer(), &app_fs());
        {
            let mut env = fixture.environment();
            env.ensure_user_scripts_loaded().unwrap();
        }
        // Only the probe engine and the environment's engine were created
        assert_eq!(fixture.factory.created(), 2);
        assert_eq!(fixture.factory.live(), 0);

        let mut env = fixture.environment();
        env.ensure_user_scripts_loaded().unwrap();
        assert_eq!(fixture.factory.execution_count("~/Scripts/app.jsx"), 2);
    }
}
