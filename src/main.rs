//! StepRunner CLI Entry Point
//!
//! Provides command-line interface for validating and running step trees
//! and for hosting a peer.
//!
//! # Usage
//!
//! ```bash
//! # Check a step file and print the resolved tree
//! steprunner validate nightly.yaml
//!
//! # Run a step tree, distributing children to peers
//! steprunner run nightly.yaml
//!
//! # Run every step in this process
//! steprunner run nightly.yaml --local
//!
//! # Host a peer
//! steprunner serve --listen 0.0.0.0:5000
//!
//! # Use a configuration file
//! steprunner -c steprunner.yaml serve
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{error, info, warn};

use steprunner::config::EngineConfig;
use steprunner::execution::{Engine, LocalDistributor};
use steprunner::notification::{
    start_step_notifier, HttpPublisher, LogPublisher, StepNotifier,
};
use steprunner::server::{self, AppState};
use steprunner::workflow::{load_step, validate, Step, StepStatus};
use steprunner::{APP_NAME, VERSION};

#[derive(Debug, Parser)]
#[command(name = "steprunner")]
#[command(author, version, about = "Distributed workflow step engine", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "STEPRUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a step file and print the resolved tree
    Validate {
        /// Step file (YAML, or JSON with a .json extension)
        file: PathBuf,
    },

    /// Validate and run a step file
    Run {
        /// Step file (YAML, or JSON with a .json extension)
        file: PathBuf,

        /// Run child steps in this process instead of posting them to peers
        #[arg(long)]
        local: bool,
    },

    /// Host a peer that accepts distributed steps
    Serve {
        /// Address to listen on
        #[arg(short, long, env = "STEPRUNNER_LISTEN")]
        listen: Option<String>,
    },
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
    println!("Distributed Workflow Step Engine");
    println!();
}

/// Prints a step tree with one coloured status per line.
fn print_tree(step: &Step) {
    print_node(step, "", "");
}

fn print_node(step: &Step, marker: &str, indent: &str) {
    let status = match step.status {
        StepStatus::Complete => step.status.to_string().green(),
        StepStatus::NotStarted => step.status.to_string().dimmed(),
        _ => step.status.to_string().yellow(),
    };

    println!(
        "{}{}{} [{}] {}",
        indent,
        marker,
        step.step_id,
        step.step_name.bold(),
        status
    );

    let child_indent = format!("{}   ", indent);
    for child in &step.sub_steps {
        print_node(child, "├─ ", &child_indent);
    }
    for child in &step.transition_steps {
        print_node(child, "└→ ", &child_indent);
    }
}

/// Starts the status notifier configured for this process.
fn start_notifier(config: &EngineConfig, engine: &Engine) -> StepNotifier {
    let batch = config.notifications.batch_config();

    match &config.notifications.endpoint {
        Some(endpoint) => {
            info!("Publishing notifications to {}", endpoint);
            start_step_notifier(HttpPublisher::new(engine.http().clone(), endpoint), batch)
        }
        None => start_step_notifier(LogPublisher, batch),
    }
}

fn build_engine(config: &EngineConfig) -> Result<Engine, Box<dyn std::error::Error>> {
    let mut engine = Engine::new(config)?;
    let notifier = start_notifier(config, &engine);
    engine.set_notifier(notifier);
    Ok(engine)
}

async fn shutdown_notifier(engine: &Engine) {
    if let Some(notifier) = engine.notifier() {
        notifier.shutdown().await;
    }
}

fn validate_file(file: &Path) -> Result<bool, Box<dyn std::error::Error>> {
    info!("Loading step file: {}", file.display());
    let mut step = load_step(file)?;

    validate(&mut step)?;

    info!("Step tree is valid ({} steps)", step.tree_size());
    print_tree(&step);
    Ok(true)
}

async fn run_file(
    config: &EngineConfig,
    file: &Path,
    local: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    info!("Loading step file: {}", file.display());
    let step = load_step(file)?;

    let mut engine = build_engine(config)?;
    if local {
        info!("Mode: LOCAL (child steps run in this process)");
        engine.set_distributor(LocalDistributor);
    }

    let result = engine.submit(step).await;
    shutdown_notifier(&engine).await;
    let result = result?;

    println!();
    print_tree(&result);
    println!();

    if result.is_complete() {
        info!("Run '{}' completed", result.run_name);
    } else {
        warn!("Run '{}' stopped at {}", result.run_name, result.status);
    }

    Ok(result.is_complete())
}

async fn serve(
    config: &EngineConfig,
    listen: Option<String>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let addr = listen.unwrap_or_else(|| config.listen.clone());
    let engine = build_engine(config)?;

    info!("Work root: {}", config.work_root.display());
    info!("Log file: {}", config.log_file.display());

    let state = AppState::new(engine.clone(), config.log_file.clone());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down");
    };

    let served = server::serve_on(&addr, state, shutdown).await;
    shutdown_notifier(&engine).await;
    served?;

    Ok(true)
}

/// Main application entry point.
async fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;
    if let Some(path) = &cli.config {
        info!("Configuration: {}", path.display());
    }

    match cli.command {
        Command::Validate { file } => validate_file(&file),
        Command::Run { file, local } => run_file(&config, &file, local).await,
        Command::Serve { listen } => serve(&config, listen).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    print_banner();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
