use crate::config::CliConfig;
use crate::console::{CliExecutorFactory, ConsoleSchedulerOutput};
use crate::ScheduleCommand;
use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use pipeliner_core::daemon::DaemonManager;
use pipeliner_core::error::ScheduleError;
use pipeliner_core::schedule_file::add_from_file;
use pipeliner_core::scheduler::{
    wait_for_shutdown_signal, SchedulerOutput, StartOptions, TracingSchedulerOutput,
    WorkflowScheduler,
};
use pipeliner_core::storage::{JsonHistoryStore, ScheduleStore};
use pipeliner_core::timezone::{next_fire, parse_cron, resolve_timezone};
use pipeliner_core::Schedule;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const STARTUP_POLL_ATTEMPTS: u32 = 3;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(800);

pub async fn execute(
    config: &CliConfig,
    command: ScheduleCommand,
    daemon_process: bool,
) -> Result<ExitCode> {
    let paths = config.paths();
    let store = ScheduleStore::new(paths.schedules_file.clone());
    let daemon = DaemonManager::new(&paths);

    match command {
        ScheduleCommand::Add { file } => add(&store, &file),
        ScheduleCommand::List => {
            list(&store)?;
            Ok(ExitCode::SUCCESS)
        }
        ScheduleCommand::Remove { id } => {
            if !store.remove(&id)? {
                return Err(ScheduleError::NotFound(id).into());
            }
            println!("✓ Schedule {} removed", id);
            restart_hint(&daemon)?;
            Ok(ExitCode::SUCCESS)
        }
        ScheduleCommand::Toggle { id } => {
            let schedule = store.toggle(&id)?;
            let state = if schedule.enabled { "enabled" } else { "disabled" };
            println!("✓ Schedule {} {}", schedule.display_name(), state);
            restart_hint(&daemon)?;
            Ok(ExitCode::SUCCESS)
        }
        ScheduleCommand::Start { daemon: detach } if detach && !daemon_process => {
            spawn_daemon(config, &daemon).await
        }
        ScheduleCommand::Start { .. } => run_scheduler(config, store, daemon, daemon_process).await,
        ScheduleCommand::Stop => {
            let scheduler = build_scheduler(config, store, daemon, daemon_process);
            if scheduler.stop_daemon().await? {
                println!("✓ Scheduler daemon stopped");
            } else {
                println!("Scheduler daemon is not running");
            }
            Ok(ExitCode::SUCCESS)
        }
        ScheduleCommand::Status => {
            status(&store, &daemon)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn add(store: &ScheduleStore, file: &std::path::Path) -> Result<ExitCode> {
    let report = add_from_file(store, file)?;

    for schedule in &report.added {
        println!(
            "✓ Added schedule {} [{}] {}",
            schedule.display_name(),
            schedule.id,
            schedule.cron
        );
    }
    for (name, reason) in &report.rejected {
        eprintln!("✗ {}: {}", name, reason);
    }

    if report.added.is_empty() {
        bail!("No schedules were added");
    }
    Ok(ExitCode::SUCCESS)
}

fn list(store: &ScheduleStore) -> Result<()> {
    let schedules = store.load()?;
    if schedules.is_empty() {
        println!("No schedules.");
        return Ok(());
    }

    for schedule in &schedules {
        let state = if schedule.enabled { "enabled" } else { "disabled" };
        println!(
            "{}  {}  {}  [{}]",
            schedule.id,
            schedule.display_name(),
            schedule.cron,
            state
        );
        println!("    workflow: {}", schedule.workflow_path.display());
        if let Some(timezone) = &schedule.timezone {
            println!("    timezone: {}", timezone);
        }
        if let Some(profile) = &schedule.profile {
            println!("    profile:  {}", profile);
        }
        if let Some(last_run) = schedule.last_run {
            println!(
                "    last run: {}",
                last_run.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            );
        }
        if schedule.enabled {
            println!("    next run: {}", next_run_text(schedule));
        }
    }
    Ok(())
}

fn next_run_text(schedule: &Schedule) -> String {
    let next = parse_cron(&schedule.cron).and_then(|cron| {
        let zone = resolve_timezone(schedule.timezone.as_deref())?;
        Ok(next_fire(&cron, zone, Utc::now()))
    });
    match next {
        Ok(Some(next)) => next
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        Ok(None) => "never".to_string(),
        Err(e) => format!("invalid ({})", e),
    }
}

fn restart_hint(daemon: &DaemonManager) -> Result<()> {
    if daemon.is_running()? {
        println!("Restart the scheduler daemon to apply the change.");
    }
    Ok(())
}

fn status(store: &ScheduleStore, daemon: &DaemonManager) -> Result<()> {
    let status = daemon.status()?;
    match status.pid {
        Some(pid) if status.running => {
            println!("Scheduler daemon is running (PID: {})", pid);
            if let Some(started) = status.start_time {
                println!(
                    "  started: {}",
                    started.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
                );
            }
            if let Some(uptime) = status.uptime(Utc::now()) {
                let secs = uptime.num_seconds().max(0);
                println!(
                    "  uptime:  {}h {}m {}s",
                    secs / 3600,
                    (secs % 3600) / 60,
                    secs % 60
                );
            }
        }
        _ => {
            println!("Scheduler daemon is not running");
            if let Some(log) = daemon.read_error_log() {
                println!("Last startup errors:\n{}", log);
            }
        }
    }

    let schedules = store.load()?;
    let enabled = schedules.iter().filter(|schedule| schedule.enabled).count();
    println!("Schedules: {} enabled, {} total", enabled, schedules.len());
    Ok(())
}

fn build_scheduler(
    config: &CliConfig,
    store: ScheduleStore,
    daemon: DaemonManager,
    daemon_process: bool,
) -> WorkflowScheduler {
    let factory = Arc::new(CliExecutorFactory {
        backoff: config.retry_backoff(),
        history: Arc::new(JsonHistoryStore::new(config.paths().history_dir)),
        daemon_process,
    });
    let output: Arc<dyn SchedulerOutput> = if daemon_process {
        Arc::new(TracingSchedulerOutput)
    } else {
        Arc::new(ConsoleSchedulerOutput)
    };
    WorkflowScheduler::new(Arc::new(store), daemon, factory, output)
}

/// Re-launch this binary as the detached daemon and wait for it to come up
async fn spawn_daemon(config: &CliConfig, daemon: &DaemonManager) -> Result<ExitCode> {
    if let Some(pid) = daemon.pid()? {
        return Err(ScheduleError::AlreadyRunning { pid }.into());
    }
    daemon.clear_error_log()?;

    let args = vec![
        "schedule".to_string(),
        "start".to_string(),
        "--daemon".to_string(),
        "--home".to_string(),
        config.home.to_string_lossy().into_owned(),
    ];
    let mut child = daemon.spawn_background(&args)?;
    tracing::debug!("Waiting for daemon process {}", child.id());

    match daemon
        .wait_until_running(&mut child, STARTUP_POLL_ATTEMPTS, STARTUP_POLL_INTERVAL)
        .await
    {
        Some(pid) => {
            println!("✓ Scheduler daemon started (PID: {})", pid);
            println!("  log: {}", config.paths().daemon_log().display());
            Ok(ExitCode::SUCCESS)
        }
        None => Err(ScheduleError::DaemonStartFailed {
            log: daemon.read_error_log(),
        }
        .into()),
    }
}

/// Run the scheduler in this process until SIGINT or SIGTERM
async fn run_scheduler(
    config: &CliConfig,
    store: ScheduleStore,
    daemon: DaemonManager,
    daemon_process: bool,
) -> Result<ExitCode> {
    let scheduler = build_scheduler(config, store, daemon.clone(), daemon_process);

    if let Err(e) = scheduler.start(daemon_process, StartOptions::default()) {
        if daemon_process {
            if let Err(log_error) = daemon.write_error(&e.to_string()) {
                tracing::error!("Failed to write daemon error log: {}", log_error);
            }
        }
        return Err(e).context("Failed to start scheduler");
    }

    wait_for_shutdown_signal().await;
    scheduler.shutdown(daemon_process)?;
    Ok(ExitCode::SUCCESS)
}
