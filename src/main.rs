//! FlowRunner CLI Entry Point
//!
//! Runs a YAML workflow layout with simulated step handlers, either
//! in-process or through the in-memory queue and a local worker.
//!
//! # Usage
//!
//! ```bash
//! # Execute a layout in-process
//! flowrunner place_order.yaml
//!
//! # Make one step fail to watch the compensation
//! flowrunner place_order.yaml --fail-at ship
//!
//! # Go through the queue, with a result timeout
//! flowrunner place_order.yaml --distributed --timeout 5000
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use colored::*;
use log::{info, warn};
use serde_json::{json, Value};

use flowrunner::distributed::{
    CompletionTracker, DistributedExecutor, FlowWorker, InMemoryQueue, WorkflowRegistry,
};
use flowrunner::execution::{Engine, ExecutionReport};
use flowrunner::monitoring::EventType;
use flowrunner::workflow::{load_layout, FlowMeta, StepHandler, WorkflowDefinition, WorkflowLayout};
use flowrunner::{RunnerConfig, StepError, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    layout_path: Option<String>,
    input: Option<String>,
    fail_at: Option<String>,
    distributed: bool,
    config_path: Option<String>,
    timeout_ms: Option<u64>,
    verbose: bool,
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
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Saga Workflow Orchestration Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <LAYOUT_FILE>");
    println!();
    println!("Arguments:");
    println!("  <LAYOUT_FILE>       Path to workflow layout YAML file");
    println!();
    println!("Options:");
    println!("  --input JSON        Input data for the execution (default: {{}})");
    println!("  --fail-at STEP      Make the named step fail");
    println!("  --distributed       Run through the in-memory queue and a local worker");
    println!("  --config PATH       Runtime configuration YAML file");
    println!("  --timeout MS        Result timeout in distributed mode");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner place_order.yaml --input '{{\"amount\": 30}}'");
    println!("  flowrunner place_order.yaml --fail-at ship");
    println!("  flowrunner place_order.yaml --distributed --timeout 5000");
}

/// Returns the value following an option.
fn option_value(args: &[String], i: &mut usize, name: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires an argument", name))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
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
            "--distributed" => config.distributed = true,
            "--verbose" | "-v" => config.verbose = true,
            "--input" => config.input = Some(option_value(args, &mut i, "--input")?),
            "--fail-at" => config.fail_at = Some(option_value(args, &mut i, "--fail-at")?),
            "--config" => config.config_path = Some(option_value(args, &mut i, "--config")?),
            "--timeout" => {
                let value = option_value(args, &mut i, "--timeout")?;
                config.timeout_ms = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid timeout value: {}", value))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.layout_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.layout_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Loads runtime configuration from file, environment and flags.
fn runtime_config(config: &Config) -> Result<RunnerConfig, Box<dyn std::error::Error>> {
    let mut runtime = match &config.config_path {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    }
    .apply_env()?;

    if let Some(ms) = config.timeout_ms {
        runtime.result_timeout_ms = ms;
    }
    Ok(runtime)
}

/// Binds a simulated handler to every step of the layout.
fn simulated_definition(
    layout: WorkflowLayout,
    fail_at: Option<&str>,
) -> Result<WorkflowDefinition, Box<dyn std::error::Error>> {
    if let Some(step) = fail_at {
        if !layout.step_names().any(|name| name == step) {
            return Err(format!("--fail-at names unknown step '{}'", step).into());
        }
    }

    let names: Vec<String> = layout.step_names().map(str::to_string).collect();
    let mut builder = WorkflowDefinition::from_layout(layout);

    for name in names {
        let fail = fail_at == Some(name.as_str());
        builder = builder.step(name.clone(), simulated_step(name, fail));
    }

    Ok(builder.build()?)
}

fn simulated_step(name: String, fail: bool) -> StepHandler {
    let rollback_name = name.clone();

    StepHandler::new(move |ctx| {
        let name = name.clone();
        async move {
            if fail {
                return Err::<Value, StepError>(format!("simulated failure in '{}'", name).into());
            }
            ctx.logger().debug(format!("input: {}", ctx.data()));
            Ok(json!({ "step": name }))
        }
    })
    .with_rollback(move |ctx| {
        let name = rollback_name.clone();
        async move {
            ctx.logger().info(format!("undoing '{}'", name));
            Ok::<(), StepError>(())
        }
    })
}

/// Prints the outcome of an in-process run.
fn print_report(report: &ExecutionReport) {
    println!("{}", report.timeline.gantt_chart());

    for event in report.timeline.get_events() {
        let label = event.event_type.label();
        let label = match event.event_type {
            EventType::Started => label.dimmed(),
            EventType::Completed => label.green(),
            EventType::Failed | EventType::RollbackFailed => label.red(),
            EventType::RolledBack => label.yellow(),
        };
        println!("  {:<24} {}", event.step_id, label);
    }
    println!();

    if let Some(rollback) = &report.rollback {
        println!(
            "{} {} compensated, {} without compensation, {} failed",
            "Rollback:".yellow(),
            rollback.rolled_back.len(),
            rollback.skipped.len(),
            rollback.failures.len()
        );
    }
}

fn print_result(result: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{} Workflow completed", "✓".green());
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

async fn run_local(
    definition: WorkflowDefinition,
    input: Value,
) -> Result<(), Box<dyn std::error::Error>> {
    let meta = FlowMeta::new(definition.name());
    info!("Mode: in-process (flow {})", meta.flow_id);

    let report = Engine::new(definition).execute_with_timeline(input, meta).await;
    print_report(&report);

    let result = report.result?;
    print_result(&result)
}

async fn run_distributed(
    definition: WorkflowDefinition,
    input: Value,
    runtime: &RunnerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let definition = Arc::new(definition);
    let queue = Arc::new(InMemoryQueue::new());

    let worker = FlowWorker::new(
        queue.clone(),
        WorkflowRegistry::new().with(definition.clone()),
        runtime.worker(),
    );
    let workers = worker.start()?;

    let executor = DistributedExecutor::new(
        queue,
        CompletionTracker::new(runtime.tracker()),
        runtime.bridge(),
    );

    let handle = executor.execute(&definition, input).await?;
    info!(
        "Mode: distributed (job {} on topic {})",
        handle.id(),
        runtime.topic_for(definition.name())
    );

    let outcome = handle.result().await;
    workers.stop();
    executor.stop();

    print_result(&outcome?)
}

/// Main application entry point.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    let Some(layout_path) = config.layout_path.as_deref() else {
        print_usage();
        return Err("missing layout file".into());
    };

    setup_logging(config.verbose);
    print_banner();

    let runtime = runtime_config(&config)?;

    let input: Value = match &config.input {
        Some(text) => serde_json::from_str(text)
            .map_err(|e| format!("--input is not valid JSON: {}", e))?,
        None => json!({}),
    };

    info!("Loading layout: {}", layout_path);
    let layout = load_layout(layout_path)?;
    if let Some(step) = &config.fail_at {
        warn!("Step '{}' will fail", step);
    }

    let definition = simulated_definition(layout, config.fail_at.as_deref())?;

    if config.distributed {
        run_distributed(definition, input, &runtime).await
    } else {
        run_local(definition, input).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
