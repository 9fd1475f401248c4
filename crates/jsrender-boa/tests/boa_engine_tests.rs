use indoc::indoc;
use jsrender_boa::{BoaEngineFactory, ENGINE_NAME};
use jsrender_core::cache::MemoryCache;
use jsrender_core::engine::{EngineRegistry, EngineSelector};
use jsrender_core::fs::RealFileSystem;
use jsrender_core::{
    ComponentOptions, Container, Engine, EngineError, EngineFactory, Error, RenderConfig,
};
use jsrender_test_helpers::fixtures::{self, react_project};
use jsrender_test_helpers::mocks::RecordingExceptionHandler;
use serde_json::{json, Value};
use std::sync::Arc;

fn engine() -> Box<dyn Engine> {
    BoaEngineFactory::new().create().unwrap()
}

fn container(project: &fixtures::TestProject, config: RenderConfig) -> Container {
    let mut registry = EngineRegistry::new();
    registry.register(BoaEngineFactory::new());
    Container::with_dependencies(
        config,
        registry,
        Arc::new(RealFileSystem::new(project.root())),
        Arc::new(MemoryCache::new()),
    )
    .unwrap()
}

// ============================================================================
// Engine contract
// ============================================================================

#[test]
fn test_passes_selection_probe() {
    let mut registry = EngineRegistry::new();
    registry.register(BoaEngineFactory::new());
    let selected = EngineSelector::new(registry, None).select().unwrap();
    assert_eq!(selected.name(), ENGINE_NAME);
}

#[test]
fn test_execute_then_evaluate() {
    let mut engine = engine();
    engine
        .execute("var greeting = 'hello'; function twice(x) { return x * 2; }", "setup.js")
        .unwrap();
    assert_eq!(engine.evaluate("greeting + ' world'").unwrap(), json!("hello world"));
    assert_eq!(engine.evaluate("twice(21)").unwrap(), json!(42));
    assert_eq!(engine.evaluate("({ a: [1, 2] })").unwrap(), json!({ "a": [1, 2] }));
}

#[test]
fn test_call_function_with_json_arguments() {
    let mut engine = engine();
    engine
        .execute(
            indoc! {r#"
                function describe(user, tags) {
                    return { label: user.name + ' (' + tags.join(', ') + ')', count: tags.length };
                }
            "#},
            "describe.js",
        )
        .unwrap();
    let result = engine
        .call_function("describe", &[json!({ "name": "Ada" }), json!(["a", "b"])])
        .unwrap();
    assert_eq!(result, json!({ "label": "Ada (a, b)", "count": 2 }));
}

#[test]
fn test_calling_a_missing_function() {
    let mut engine = engine();
    match engine.call_function("nope", &[]) {
        Err(EngineError::Script(error)) => assert!(error.message.contains("not a function")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_variables() {
    let mut engine = engine();
    assert!(!engine.has_variable("config").unwrap());
    engine.set_variable("config", json!({ "debug": true })).unwrap();
    assert!(engine.has_variable("config").unwrap());
    assert_eq!(engine.evaluate("config.debug").unwrap(), json!(true));
}

#[test]
fn test_thrown_errors() {
    let mut engine = engine();

    match engine.execute("missingFunction();", "app.js") {
        Err(EngineError::Script(error)) => {
            assert!(error.message.starts_with("ReferenceError"), "{}", error.message);
            assert_eq!(error.document.as_deref(), Some("app.js"));
        }
        other => panic!("unexpected result: {:?}", other),
    }

    match engine.execute("throw 'plain string';", "app.js") {
        Err(EngineError::Script(error)) => assert_eq!(error.message, "plain string"),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_syntax_error() {
    let mut engine = engine();
    match engine.execute(fixtures::syntax_error_script(), "broken.js") {
        Err(EngineError::Script(error)) => {
            assert!(error.message.starts_with("SyntaxError"), "{}", error.message);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    // The engine stays usable
    assert_eq!(engine.evaluate("1 + 1").unwrap(), json!(2));
}

#[test]
fn test_engine_moves_between_threads() {
    let mut engine = engine();
    engine.execute("var counter = 1;", "counter.js").unwrap();
    let value = std::thread::spawn(move || engine.evaluate("counter + 1").unwrap())
        .join()
        .unwrap();
    assert_eq!(value, json!(2));
}

#[test]
fn test_dispose() {
    let mut engine = engine();
    engine.dispose();
    engine.dispose();
    assert!(engine.is_disposed());
    assert!(matches!(engine.evaluate("1"), Err(EngineError::Disposed)));
}

#[test]
fn test_deep_recursion_within_limits() {
    let mut engine = engine();
    engine
        .execute(
            "function depth(n) { return n === 0 ? 0 : 1 + depth(n - 1); }",
            "depth.js",
        )
        .unwrap();
    assert_eq!(engine.evaluate("depth(200)").unwrap(), json!(200));
}

// ============================================================================
// End to end
// ============================================================================

#[test]
fn test_render_component_end_to_end() {
    let (project, config) = react_project();
    let container = container(&project, config);
    let mut environment = container.create_environment();

    let component = environment
        .create_component(
            "HelloWorld",
            json!({ "name": "Ada" }),
            ComponentOptions {
                container_id: Some("root".to_string()),
                ..ComponentOptions::default()
            },
        )
        .unwrap();
    let html = environment.render_component(&component).unwrap();
    assert_eq!(
        html,
        "<div id=\"root\"><div data-reactroot=\"\"><h1>Welcome</h1>Hello Ada</div></div>"
    );

    let script = environment.get_init_javascript().unwrap();
    assert_eq!(
        script,
        "console.log(\"[Server] rendering Ada\");\n\
         ReactDOM.hydrate(React.createElement(HelloWorld, {\"name\":\"Ada\"}), document.getElementById(\"root\"));\n"
    );
}

#[test]
fn test_static_markup_without_engine_reuse() {
    let (project, config) = react_project();
    let container = container(
        &project,
        RenderConfig {
            reuse_engines: false,
            ..config
        },
    );
    let mut environment = container.create_environment();
    let component = environment
        .create_component(
            "HelloWorld",
            json!({ "name": "Grace" }),
            ComponentOptions {
                container_id: Some("root".to_string()),
                server_only: true,
                ..ComponentOptions::default()
            },
        )
        .unwrap();
    assert_eq!(
        environment.render_component(&component).unwrap(),
        "<div id=\"root\"><div><h1>Welcome</h1>Hello Grace</div></div>"
    );
}

#[test]
fn test_transpiled_file_is_saved_with_source_map() {
    let (project, config) = react_project();
    let container = container(&project, config);

    let output = container
        .transformer()
        .transform_and_save_file("~/Scripts/HelloWorld.jsx", false)
        .unwrap();
    assert!(output.ends_with("HelloWorld.generated.js"));

    let generated = project.read("Scripts/HelloWorld.generated.js");
    assert!(generated.contains("React.createElement('h1', null, 'Welcome')"));
    assert!(generated.contains("transpiler 7.0.0-fake"));
    assert!(generated.ends_with("//# sourceMappingURL=HelloWorld.generated.js.map"));

    let map: Value =
        serde_json::from_str(&project.read("Scripts/HelloWorld.generated.js.map")).unwrap();
    assert_eq!(map["sources"], json!(["HelloWorld.jsx"]));
    assert!(map["mappings"].as_str().unwrap().starts_with(";;;;;AAAA"));
}

#[test]
fn test_render_error_reaches_exception_handler() {
    let (project, mut config) = react_project();
    project.write("Scripts/Broken.jsx", fixtures::broken_component());
    config.scripts.push("~/Scripts/Broken.jsx".to_string());

    let mut container = container(&project, config);
    let recorder = RecordingExceptionHandler::new();
    container.set_exception_handler(Some(recorder.handler()));

    let mut environment = container.create_environment();
    let component = environment
        .create_component(
            "Broken",
            json!({}),
            ComponentOptions {
                container_id: Some("broken".to_string()),
                ..ComponentOptions::default()
            },
        )
        .unwrap();
    assert_eq!(
        environment.render_component(&component).unwrap(),
        "<div id=\"broken\"></div>"
    );

    let failures = recorder.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].component, "Broken");
    assert!(failures[0].message.contains("missingFunction"));
}

#[test]
fn test_render_error_without_handler() {
    let (project, mut config) = react_project();
    project.write("Scripts/Broken.jsx", fixtures::broken_component());
    config.scripts.push("~/Scripts/Broken.jsx".to_string());

    let container = container(&project, config);
    let mut environment = container.create_environment();
    let component = environment
        .create_component("Broken", json!({}), ComponentOptions::default())
        .unwrap();
    assert!(matches!(
        environment.render_component(&component),
        Err(Error::RuntimeExecution { .. })
    ));
}
