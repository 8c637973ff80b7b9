//! BpmnRunner CLI Entry Point
//!
//! Runs a process definition from the command line with handlers that
//! complete on their own.
//!
//! # Usage
//!
//! ```bash
//! # Run a definition from its start event
//! bpmnrunner order.yaml
//!
//! # Choose gateway branches and shorten timers
//! bpmnrunner order.yaml --choose 'In Stock?$yes' --timeout 'Payment Deadline=500'
//!
//! # Persist state and complete user tasks automatically
//! bpmnrunner order.yaml --state-dir .bpmnrunner --complete-wait-tasks
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::{json, Value};

use bpmnrunner::config::EngineConfig;
use bpmnrunner::definition::{load_definition, FlowObjectKind, ProcessDefinition};
use bpmnrunner::monitoring::History;
use bpmnrunner::persistence::FilePersistence;
use bpmnrunner::process::{Handlers, ProcessEngine, ProcessState, GUARD_SEPARATOR};
use bpmnrunner::{APP_NAME, VERSION};

/// Process id used when none is specified.
const DEFAULT_PROCESS_ID: &str = "cli-1";

/// Timer duration used for timer events without `--timeout`.
const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Upper bound on completion rounds, guards against looping processes.
const MAX_ROUNDS: usize = 1000;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    definition_path: Option<String>,
    start_event: Option<String>,
    process_id: String,
    data: Value,
    state_dir: Option<PathBuf>,
    config_path: Option<PathBuf>,
    choices: Vec<(String, String)>,
    timeouts: Vec<(String, u64)>,
    complete_wait_tasks: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definition_path: None,
            start_event: None,
            process_id: DEFAULT_PROCESS_ID.to_string(),
            data: Value::Null,
            state_dir: None,
            config_path: None,
            choices: Vec::new(),
            timeouts: Vec::new(),
            complete_wait_tasks: false,
            verbose: false,
        }
    }
}

impl Config {
    fn choice_for(&self, gateway: &str) -> Option<&str> {
        self.choices
            .iter()
            .find(|(gw, _)| gw == gateway)
            .map(|(_, flow)| flow.as_str())
    }

    fn timeout_for(&self, name: &str) -> u64 {
        self.timeouts
            .iter()
            .find(|(event, _)| event == name)
            .map(|(_, ms)| *ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
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
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("BPMN Process Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: bpmnrunner [OPTIONS] <DEFINITION>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION>            Path to a process definition (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --start NAME            Start event to trigger (default: the only one)");
    println!("  --process-id ID         Process id (default: {})", DEFAULT_PROCESS_ID);
    println!("  --data JSON             Data passed to the start event");
    println!("  --state-dir DIR         Persist process records in DIR");
    println!("  --config FILE           Engine configuration file");
    println!("  --choose GW$FLOW        Take FLOW at exclusive gateway GW (repeatable)");
    println!(
        "  --timeout NAME=MS       Timer duration of event NAME (default: {} ms)",
        DEFAULT_TIMEOUT_MS
    );
    println!("  --complete-wait-tasks   Complete user, receive and manual tasks automatically");
    println!("  --verbose               Enable debug logging");
    println!("  --help                  Show this help message");
    println!("  --version               Show version information");
    println!();
    println!("Examples:");
    println!("  bpmnrunner order.yaml");
    println!("  bpmnrunner order.yaml --choose 'In Stock?$yes' --complete-wait-tasks");
    println!("  bpmnrunner order.yaml --state-dir .bpmnrunner --process-id order-42");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", option))
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
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--complete-wait-tasks" => {
                config.complete_wait_tasks = true;
            }
            "--start" => {
                config.start_event = Some(next_value(args, &mut i, arg)?.to_string());
            }
            "--process-id" => {
                config.process_id = next_value(args, &mut i, arg)?.to_string();
            }
            "--data" => {
                let raw = next_value(args, &mut i, arg)?;
                config.data = serde_json::from_str(raw)
                    .map_err(|e| format!("Invalid --data JSON '{}': {}", raw, e))?;
            }
            "--state-dir" => {
                config.state_dir = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--config" => {
                config.config_path = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--choose" => {
                let raw = next_value(args, &mut i, arg)?;
                let (gateway, flow) = raw
                    .split_once(GUARD_SEPARATOR)
                    .ok_or_else(|| format!("Invalid --choose value '{}', expected GW$FLOW", raw))?;
                config.choices.push((gateway.to_string(), flow.to_string()));
            }
            "--timeout" => {
                let raw = next_value(args, &mut i, arg)?;
                let (name, ms) = raw
                    .rsplit_once('=')
                    .ok_or_else(|| format!("Invalid --timeout value '{}', expected NAME=MS", raw))?;
                let ms = ms
                    .parse()
                    .map_err(|_| format!("Invalid timeout milliseconds: {}", ms))?;
                config.timeouts.push((name.to_string(), ms));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.definition_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.definition_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Builds handlers that let every flow object complete on its own.
///
/// Exclusive gateways take the flow chosen with `--choose`, or their first
/// outgoing flow. Nested definitions get their own registry.
fn build_handlers(definition: &ProcessDefinition, config: &Config) -> Handlers {
    let mut handlers = Handlers::new();

    for flow_object in definition.flow_objects() {
        match &flow_object.kind {
            FlowObjectKind::ExclusiveGateway => {
                let choice = config.choice_for(&flow_object.name);
                let outgoing = definition.get_outgoing_sequence_flows(flow_object);

                for (index, flow) in outgoing.iter().enumerate() {
                    let label = if flow.name.is_empty() {
                        flow.bpmn_id.as_str()
                    } else {
                        flow.name.as_str()
                    };
                    let taken = match choice {
                        Some(chosen) => chosen == label,
                        None => index == 0,
                    };
                    handlers = handlers.guard(&flow_object.name, label, move |_ctx, _data| taken);
                }
            }
            FlowObjectKind::CallActivity { .. } | FlowObjectKind::SubProcess { .. } => {
                if let Some(called) = flow_object.called_definition() {
                    handlers = handlers.nested(
                        flow_object.name.clone(),
                        build_handlers(called, config),
                    );
                }
            }
            _ if flow_object.is_timer_event() => {
                let timeout = config.timeout_for(&flow_object.name);
                handlers = handlers.timeout(&flow_object.name, move |_ctx, _data| json!(timeout));
            }
            _ => {}
        }
    }

    handlers.on_end(|process_id, name, _data| {
        info!("  {} {} ({})", "✓".green(), name, process_id);
    })
}

/// Names of wait tasks holding a token, nested processes included.
fn waiting_tasks(engine: &ProcessEngine, state: &ProcessState, names: &mut Vec<String>) {
    for token in &state.tokens {
        if let Some(substate) = &token.substate {
            waiting_tasks(engine, substate, names);
        }

        let is_wait_task = engine
            .get_process(&token.owning_process_id)
            .and_then(|process| process.definition().get_flow_object_by_name(&token.position))
            .map(|flow_object| flow_object.is_wait_task())
            .unwrap_or(false);
        if is_wait_task {
            names.push(token.position.clone());
        }
    }
}

fn print_report(history: &History, state: &ProcessState, finished: bool) {
    println!();
    println!("{}", "Process History".bold());
    print_entries(history, 1);

    println!();
    print!("{}", history.render_timeline());

    println!();
    if finished {
        println!("Status: {}", "finished".green().bold());
    } else if state.has_tokens() {
        let positions: Vec<&str> = state.tokens.iter().map(|t| t.position.as_str()).collect();
        println!(
            "Status: {} at {}",
            "waiting".yellow().bold(),
            positions.join(", ")
        );
    } else {
        println!("Status: {}", "idle".yellow());
    }
}

fn print_entries(history: &History, depth: usize) {
    let indent = "  ".repeat(depth);
    for entry in &history.history_entries {
        let status = match entry.duration_ms() {
            Some(ms) => format!("{} ms", ms).green(),
            None => "active".yellow(),
        };
        println!(
            "{}{} {} [{}]",
            indent,
            entry.name,
            format!("({})", entry.flow_object_type).dimmed(),
            status
        );
        if let Some(subhistory) = &entry.subhistory {
            print_entries(subhistory, depth + 1);
        }
    }
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
    let Some(definition_path) = config.definition_path.clone() else {
        print_usage();
        return Err("No process definition given".into());
    };

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load definition
    info!("Loading process definition: {}", definition_path);
    let definition = load_definition(&definition_path).map_err(|e| {
        error!("Failed to load process definition: {}", e);
        format!(
            "Could not load process definition from '{}': {}",
            definition_path, e
        )
    })?;

    let start_event = match &config.start_event {
        Some(name) => name.clone(),
        None => {
            let starts = definition.get_start_events();
            match starts.as_slice() {
                [start] => start.name.clone(),
                [] => return Err("The process definition has no start event".into()),
                _ => {
                    return Err(format!(
                        "The process definition has {} start events, choose one with --start",
                        starts.len()
                    )
                    .into())
                }
            }
        }
    };

    // Create and configure engine
    let mut engine = match &config.config_path {
        Some(path) => ProcessEngine::from_config(&EngineConfig::load(path)?),
        None => ProcessEngine::new(),
    };
    if let Some(dir) = &config.state_dir {
        info!("Persisting process records in: {}", dir.display());
        engine.set_persistence(FilePersistence::new(dir));
    }

    let handlers = build_handlers(&definition, &config);
    let process_id = config.process_id.clone();
    engine.create_process(definition, handlers, &process_id)?;

    // Resume a stored process instead of starting a new one
    let resumed = !engine.get_history(&process_id)?.history_entries.is_empty();
    if resumed {
        info!("Resuming stored process '{}'", process_id);
    } else {
        info!("Triggering start event '{}'", start_event);
        engine.trigger_event(&process_id, &start_event, config.data.clone())?;
    }

    // Drive the process until nothing moves anymore
    for _ in 0..MAX_ROUNDS {
        if engine.is_finished(&process_id)? {
            break;
        }

        if config.complete_wait_tasks {
            let mut waiting = Vec::new();
            waiting_tasks(&engine, &engine.get_state(&process_id)?, &mut waiting);
            if let Some(task) = waiting.first() {
                info!("Completing wait task '{}'", task);
                engine.task_done(&process_id, task, config.data.clone())?;
                continue;
            }
        }

        if !engine.wait_for_timer_event().await? {
            break;
        }
    }

    let finished = engine.is_finished(&process_id)?;
    let state = engine.get_state(&process_id)?;
    if !finished && state.has_tokens() {
        warn!("Process '{}' is waiting for external signals", process_id);
    }

    print_report(&engine.get_history(&process_id)?, &state, finished);
    engine.close()?;

    Ok(())
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
