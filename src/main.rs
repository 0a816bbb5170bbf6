//! Stateflow CLI Entry Point
//!
//! Loads a workflow definition and runs one execution of it to completion.
//!
//! # Usage
//!
//! ```bash
//! # Run a workflow
//! stateflow rollout.yaml
//!
//! # Seed context elements
//! stateflow rollout.yaml --element instance=web-1 \
//!     --element 'standard_params=params={"hosts": ["a", "b"]}'
//!
//! # Keep instances on disk and pick up interrupted executions
//! stateflow rollout.yaml --persist --store-dir /var/lib/stateflow
//!
//! # Set worker threads
//! stateflow rollout.yaml --workers 8
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::{json, Value};

use stateflow::execution::Engine;
use stateflow::schedule::TokioScheduler;
use stateflow::workflow::{load_workflow, StateFactory};
use stateflow::{ContextElement, ElementType, EngineConfig, ExecutionStatus, APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// How long the CLI waits for an execution to finish.
const OUTCOME_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    engine: EngineConfig,
    elements: Vec<ContextElement>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            engine: EngineConfig::default(),
            elements: Vec::new(),
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Resumable Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: stateflow [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>          Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --element TYPE=NAME[=JSON]  Seed a context element (repeatable)");
    println!("  --workers N              Worker threads (default: number of CPUs)");
    println!("  --store-dir PATH         Directory for persisted instances");
    println!("  --persist                Keep instances on disk and recover on start");
    println!("  --verbose                Enable debug logging");
    println!("  --help                   Show this help message");
    println!("  --version                Show version information");
    println!();
    println!("Environment:");
    println!("  STATEFLOW_WORKERS, STATEFLOW_HOME, STATEFLOW_PERSIST, RUST_LOG");
    println!();
    println!("Examples:");
    println!("  stateflow rollout.yaml --element instance=web-1");
    println!("  stateflow rollout.yaml --persist --workers 8");
}

/// Parses `TYPE=NAME` or `TYPE=NAME=JSON` into a context element.
fn parse_element(spec: &str) -> Result<ContextElement, String> {
    let mut parts = spec.splitn(3, '=');
    let element_type = parts.next().unwrap_or_default().trim();
    let name = parts.next().map(str::trim).unwrap_or_default();

    if element_type.is_empty() || name.is_empty() {
        return Err(format!("Invalid element '{}': expected TYPE=NAME", spec));
    }

    let payload = match parts.next() {
        Some(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|e| format!("Invalid element payload for '{}': {}", name, e))?,
        None => json!({ "name": name }),
    };

    Ok(ContextElement::new(ElementType::parse(element_type), name, payload))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--persist" => {
                config.engine.persist = true;
            }
            "--workers" => {
                i += 1;
                if i >= args.len() {
                    return Err("--workers requires a number argument".to_string());
                }
                config.engine.workers = match args[i].parse() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(format!("Invalid workers value: {}", args[i])),
                };
            }
            "--store-dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("--store-dir requires a path argument".to_string());
                }
                config.engine.store_dir = PathBuf::from(&args[i]);
            }
            "--element" | "-e" => {
                i += 1;
                if i >= args.len() {
                    return Err("--element requires a TYPE=NAME argument".to_string());
                }
                config.elements.push(parse_element(&args[i])?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load and compile workflow
    info!("Loading workflow: {}", config.workflow_path);
    let definition = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", config.workflow_path, e)
    })?;
    let graph = StateFactory::new().build(&definition)?;
    let workflow_name = graph.name().to_string();
    info!("Workflow '{}' loaded: {} states", workflow_name, graph.len());

    // Timers run on a tokio runtime; states run on the worker pool
    let runtime = tokio::runtime::Runtime::new()?;
    let scheduler = Arc::new(TokioScheduler::new(runtime.handle().clone()));

    info!(
        "Workers: {}, store: {}",
        config.engine.workers,
        if config.engine.persist {
            config.engine.instances_dir().display().to_string()
        } else {
            "memory".to_string()
        }
    );
    let engine = Engine::new(config.engine.services(scheduler)?);
    engine.register_workflow(graph);

    if config.engine.persist {
        let report = engine.recover()?;
        if report.paused > 0 {
            warn!("{} paused instance(s) left untouched", report.paused);
        }
    }

    // Execute workflow
    let execution_id = engine.start(&workflow_name, config.elements)?;
    let outcome = engine.wait_for_outcome(&execution_id, OUTCOME_TIMEOUT)?;

    // Print summary
    println!("{}", engine.timeline().summary());
    println!("Execution {} finished: {}", execution_id, outcome.status);
    if !outcome.output.is_null() {
        println!("Output: {}", outcome.output);
    }

    if outcome.status != ExecutionStatus::Success {
        let reason = outcome.error_message.unwrap_or_else(|| "no details".to_string());
        return Err(format!("Workflow ended {}: {}", outcome.status, reason).into());
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
