use anyhow::Context as _;
use clap::{Parser, Subcommand};
use jsrender_boa::{BoaEngineFactory, DEFAULT_STACK_SIZE};
use jsrender_core::engine::EngineRegistry;
use jsrender_core::{CliOverrides, ComponentOptions, Container, RenderConfig, Transformer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Configuration files looked up in the current directory, in order
const DEFAULT_CONFIG_FILES: [&str; 3] = ["jsrender.json", "jsrender.yaml", "jsrender.yml"];

/// jsrender - server-side rendering of JavaScript components
#[derive(Parser, Debug)]
#[command(name = "jsrender")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a jsrender.json or jsrender.yaml configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Create a fresh engine per thread instead of using the pool
    #[arg(long, global = true)]
    no_reuse_engines: bool,

    /// Number of engines created when the pool starts
    #[arg(long, value_name = "N", global = true)]
    start_engines: Option<usize>,

    /// Maximum number of pooled engines
    #[arg(long, value_name = "N", global = true)]
    max_engines: Option<usize>,

    /// Leases before an engine is replaced (0 = unlimited)
    #[arg(long, value_name = "N", global = true)]
    max_usages_per_engine: Option<usize>,

    /// Precompile scripts when the engine supports it
    #[arg(long, global = true)]
    allow_precompilation: bool,

    /// Engine to use when several are registered
    #[arg(long, value_name = "NAME", global = true)]
    engine: Option<String>,

    /// Additional script to transpile and load (repeatable)
    #[arg(long = "script", value_name = "FILE", global = true)]
    scripts: Vec<String>,

    /// Additional rendering library script (repeatable)
    #[arg(long = "library-script", value_name = "FILE", global = true)]
    library_scripts: Vec<String>,

    /// Additional transpiler script (repeatable)
    #[arg(long = "transpiler-script", value_name = "FILE", global = true)]
    transpiler_scripts: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default jsrender.json to the current directory
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Transpile scripts to .generated.js files next to their sources
    Precompile {
        /// Files or glob patterns (defaults to the configured scripts)
        #[arg(value_name = "FILE")]
        files: Vec<String>,

        /// Embed source maps in the generated files instead of writing .map files
        #[arg(long)]
        inline_source_map: bool,

        /// Watch the files and transpile again when they change
        #[arg(short, long)]
        watch: bool,
    },

    /// Render a component to HTML on stdout
    Render {
        /// Component name, e.g. `HelloWorld` or `Components.Banner`
        component: String,

        /// Component props as JSON
        #[arg(long, value_name = "JSON", default_value = "{}")]
        props: String,

        /// Id of the container element
        #[arg(long, value_name = "ID")]
        container_id: Option<String>,

        /// Tag of the container element
        #[arg(long, value_name = "TAG")]
        container_tag: Option<String>,

        /// Class of the container element
        #[arg(long, value_name = "CLASS")]
        container_class: Option<String>,

        /// Render static markup that will not be hydrated
        #[arg(long)]
        server_only: bool,

        /// Print the client initialisation script after the HTML
        #[arg(long)]
        init_script: bool,
    },

    /// Evaluate an expression once the configured scripts are loaded
    Exec {
        /// JavaScript expression
        expression: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so rendered output can be piped
    // Set RUST_LOG=debug for detailed logs
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Init { force } = cli.command {
        return init_project(force);
    }

    let config = load_config(&cli)?;
    let container = create_container(config)?;

    match cli.command {
        Command::Init { .. } => Ok(()),
        Command::Precompile {
            files,
            inline_source_map,
            watch,
        } => {
            let files = resolve_files(&container, &files)?;
            if watch {
                watch_mode(&container, &files, inline_source_map)
            } else {
                precompile(&container, &files, inline_source_map)
            }
        }
        Command::Render {
            component,
            props,
            container_id,
            container_tag,
            container_class,
            server_only,
            init_script,
        } => {
            let props: Value =
                serde_json::from_str(&props).context("--props is not valid JSON")?;
            let options = ComponentOptions {
                container_id,
                container_tag,
                container_class,
                client_only: false,
                server_only,
            };
            render(&container, &component, props, options, init_script)
        }
        Command::Exec { expression } => exec(&container, &expression),
    }
}

/// Write a default configuration file
fn init_project(force: bool) -> anyhow::Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILES[0]);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    RenderConfig::init_file(path)?;
    println!("Created {}", path.display());
    println!("Add your scripts, then run 'jsrender render <Component>'.");
    Ok(())
}

/// Load the configuration file (explicit or found in the current
/// directory) and apply command line overrides
fn load_config(cli: &Cli) -> anyhow::Result<RenderConfig> {
    let mut config = match &cli.config {
        Some(path) => RenderConfig::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => match DEFAULT_CONFIG_FILES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
        {
            Some(path) => RenderConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => {
                debug!("No configuration file found, using defaults");
                RenderConfig::default()
            }
        },
    };

    config.merge_with_cli(CliOverrides {
        reuse_engines: cli.no_reuse_engines.then_some(false),
        start_engines: cli.start_engines,
        max_engines: cli.max_engines,
        max_usages_per_engine: cli.max_usages_per_engine,
        allow_precompilation: cli.allow_precompilation.then_some(true),
        default_engine_name: cli.engine.clone(),
        scripts: cli.scripts.clone(),
        library_scripts: cli.library_scripts.clone(),
        transpiler_scripts: cli.transpiler_scripts.clone(),
    });
    config.validate()?;
    Ok(config)
}

fn create_container(config: RenderConfig) -> anyhow::Result<Container> {
    let mut registry = EngineRegistry::new();
    registry.register(
        BoaEngineFactory::new().with_stack_sizes(DEFAULT_STACK_SIZE, config.large_stack_size),
    );

    let mut container = Container::new(config, registry)?;
    container.set_exception_handler(Some(Arc::new(
        |e: &jsrender_core::Error, component: &str, container_id: &str| {
            error!(
                "Failed to render {} into #{}: {}",
                component, container_id, e
            );
        },
    )));
    debug!(
        "Container ready ({} engine)",
        container.engine_manager().engine_name()
    );
    Ok(container)
}

/// Expand glob patterns; plain names are kept as given. No arguments means
/// the configured scripts.
fn resolve_files(container: &Container, patterns: &[String]) -> anyhow::Result<Vec<String>> {
    use rustc_hash::FxHashSet;

    let patterns: Vec<String> = if patterns.is_empty() {
        container.config().scripts.clone()
    } else {
        patterns.to_vec()
    };

    let mut seen = FxHashSet::default();
    let mut files = Vec::new();
    for pattern in patterns {
        if !pattern.contains(['*', '?', '[']) {
            if seen.insert(pattern.clone()) {
                files.push(pattern);
            }
            continue;
        }

        let mapped = container.file_system().map_path(&pattern);
        let mut matched = false;
        for entry in glob::glob(&mapped.to_string_lossy())
            .with_context(|| format!("Invalid glob pattern '{}'", pattern))?
        {
            match entry {
                Ok(path) => {
                    let file = path.to_string_lossy().into_owned();
                    // Generated output matches the same patterns as its source
                    if file.ends_with(".generated.js") {
                        continue;
                    }
                    matched = true;
                    if seen.insert(file.clone()) {
                        files.push(file);
                    }
                }
                Err(e) => warn!("Skipping unreadable path: {}", e),
            }
        }
        if !matched {
            warn!("No files match '{}'", pattern);
        }
    }

    if files.is_empty() {
        anyhow::bail!("No input files. Pass files or configure 'scripts'.");
    }
    Ok(files)
}

/// Transpile every file in parallel
fn precompile(container: &Container, files: &[String], inline_source_map: bool) -> anyhow::Result<()> {
    use rayon::prelude::*;

    info!("Transpiling {} file(s)...", files.len());
    let transformer = container.transformer();
    let results: Vec<_> = files
        .par_iter()
        .map(|file| (file, transformer.transform_and_save_file(file, inline_source_map)))
        .collect();

    let mut failures = 0;
    for (file, result) in results {
        match result {
            Ok(output) => info!("Generated: {}", output.display()),
            Err(e) => {
                failures += 1;
                eprintln!("Error transpiling {}: {}", file, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} file(s) failed to transpile", failures, files.len());
    }
    info!("Transpilation completed successfully!");
    Ok(())
}

fn render(
    container: &Container,
    component: &str,
    props: Value,
    options: ComponentOptions,
    init_script: bool,
) -> anyhow::Result<()> {
    let mut environment = container.create_environment();
    let component = environment.create_component(component, props, options)?;
    let html = environment.render_component(&component)?;
    println!("{}", html);

    if init_script {
        println!("<script>\n{}</script>", environment.get_init_javascript()?);
    }
    Ok(())
}

fn exec(container: &Container, expression: &str) -> anyhow::Result<()> {
    let mut environment = container.create_environment();
    let value: Value = environment.execute_with_result(expression)?;
    match value {
        Value::String(text) => println!("{}", text),
        other => println!("{}", other),
    }
    Ok(())
}

/// Watch mode - transpile again on file changes
fn watch_mode(container: &Container, files: &[String], inline_source_map: bool) -> anyhow::Result<()> {
    use notify::{Event, RecursiveMode, Watcher};
    use std::sync::mpsc::{channel, RecvTimeoutError};
    use std::time::Duration;

    println!("Watching for changes... (Press Ctrl+C to stop)");
    if let Err(e) = precompile(container, files, inline_source_map) {
        eprintln!("{}", e);
    }

    let watched: Vec<(PathBuf, &String)> = files
        .iter()
        .map(|file| (container.file_system().map_path(file), file))
        .collect();

    let (tx, rx) = channel();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;

    let mut directories: Vec<&Path> = watched
        .iter()
        .filter_map(|(path, _)| path.parent())
        .collect();
    directories.sort();
    directories.dedup();
    for directory in directories {
        watcher.watch(directory, RecursiveMode::NonRecursive)?;
    }

    let debounce = Duration::from_millis(100);
    loop {
        let event = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow::anyhow!("File watcher disconnected"));
            }
        };

        let mut changed = changed_files(&watched, &event);
        if changed.is_empty() {
            continue;
        }

        // Editors and `fs::write` produce bursts of events; let them settle
        std::thread::sleep(debounce);
        while let Ok(event) = rx.try_recv() {
            for file in changed_files(&watched, &event) {
                if !changed.contains(&file) {
                    changed.push(file);
                }
            }
        }

        for (path, _) in watched.iter().filter(|(_, file)| changed.contains(*file)) {
            // The file-watching cache may not have seen the change yet
            container.cache().remove(&Transformer::cache_key(path));
        }

        println!("\nFile changed, transpiling again...");
        if let Err(e) = precompile(container, &changed, inline_source_map) {
            eprintln!("{}", e);
        }
    }
}

/// Watched files touched by a content change or creation event
fn changed_files(watched: &[(PathBuf, &String)], event: &notify::Event) -> Vec<String> {
    use notify::event::{EventKind, ModifyKind};

    if !matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
    ) {
        return Vec::new();
    }

    watched
        .iter()
        .filter(|(path, _)| event.paths.iter().any(|changed| changed.file_name() == path.file_name()))
        .map(|(_, file)| (*file).clone())
        .collect()
}
