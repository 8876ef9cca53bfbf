use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pipeliner_core::daemon::DaemonManager;
use pipeliner_core::paths::{self, StatePaths, HOME_ENV};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod console;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "tp")]
#[command(about = "Declarative task pipeline runner with cron scheduling", version, long_about = None)]
struct Cli {
    /// State directory for history, schedules and daemon files
    #[arg(long, global = true, env = HOME_ENV)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a workflow file
    Run(RunArgs),

    /// Manage cron schedules and the scheduler daemon
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },

    /// Inspect stored execution history
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow file (.yaml, .yml or .json)
    pub file: PathBuf,

    /// Profile whose variables answer prompts
    #[arg(short, long)]
    pub profile: Option<String>,

    /// Variable override, KEY=VALUE. Wins over profile values.
    #[arg(short = 'v', long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Suppress step output
    #[arg(short, long)]
    pub silent: bool,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// Add the schedules defined in a schedule file
    Add { file: PathBuf },

    /// List schedules
    List,

    /// Remove a schedule
    Remove { id: String },

    /// Enable or disable a schedule
    Toggle { id: String },

    /// Run the scheduler
    Start {
        /// Detach and run in the background
        #[arg(short, long)]
        daemon: bool,
    },

    /// Stop the background scheduler
    Stop,

    /// Show whether the background scheduler is running
    Status,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommand {
    /// List stored runs, newest first
    List,

    /// Show the timeline of a stored run
    Show { file: String },

    /// Delete one stored run
    Remove { file: String },

    /// Delete every stored run
    Clean,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got \"{}\"", raw)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let home = cli.home.unwrap_or_else(|| StatePaths::from_env().root);
    let daemon_process = paths::is_daemon_process();
    let config = CliConfig::load(&home)
        .map_err(|e| record_daemon_failure(daemon_process, &StatePaths::new(&home), e))?;

    let default_filter = match &cli.command {
        Command::Schedule {
            command: ScheduleCommand::Start { .. },
        } => "info",
        _ => "warn",
    };
    let log_file = daemon_process.then(|| config.paths().daemon_log());
    init_tracing(&config, default_filter, log_file.as_deref())
        .map_err(|e| record_daemon_failure(daemon_process, &config.paths(), e))?;

    tracing::debug!("State directory: {}", home.display());

    match cli.command {
        Command::Run(args) => commands::run::execute(&config, args).await,
        Command::Schedule { command } => {
            commands::schedule::execute(&config, command, daemon_process).await
        }
        Command::History { command } => commands::history::execute(&config, command).await,
    }
}

/// A detached daemon has no terminal, so failures before the scheduler starts
/// go to the error log the launching process reads back
fn record_daemon_failure(
    daemon_process: bool,
    paths: &StatePaths,
    error: anyhow::Error,
) -> anyhow::Error {
    if daemon_process {
        if let Err(log_error) = DaemonManager::new(paths).write_error(&format!("{:#}", error)) {
            eprintln!("Failed to write daemon error log: {}", log_error);
        }
    }
    error
}

fn init_tracing(config: &CliConfig, default_filter: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.logging.filter.as_deref().unwrap_or(default_filter))
    });

    let Some(log_file) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        return Ok(());
    };

    if let Some(dir) = log_file.parent() {
        std::fs::create_dir_all(dir).context("Failed to create daemon directory")?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open {}", log_file.display()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_writer(Mutex::new(file));
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
