// Terminal implementations of the engine's ports

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use pipeliner_core::events::{EventType, History, ResolvedValue};
use pipeliner_core::ports::{
    ExecutionOutput, HistorySink, OutputStream, PromptPort, SilentOutput, StepLabel,
    TracingOutput,
};
use pipeliner_core::runner::CommandOutcome;
use pipeliner_core::scheduler::{ExecutorFactory, SchedulerOutput};
use pipeliner_core::timezone::ScheduleZone;
use pipeliner_core::workflow::{RetryBackoff, WorkflowExecutor};
use pipeliner_core::{ChoiceOption, Schedule};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

/// Asks on stdout, reads answers from stdin
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompt;

#[async_trait::async_trait]
impl PromptPort for StdinPrompt {
    async fn choose(&self, message: &str, options: &[ChoiceOption]) -> Result<ChoiceOption> {
        println!("? {}", message);
        for (i, option) in options.iter().enumerate() {
            println!("  {}) {}", i + 1, option.label);
        }

        loop {
            let answer = read_line(format!("Select 1-{}: ", options.len())).await?;
            match select_option(&answer, options) {
                Some(option) => return Ok(option.clone()),
                None => println!("Invalid selection: {}", answer.trim()),
            }
        }
    }

    async fn text(&self, message: &str, default: Option<&str>) -> Result<String> {
        let question = match default {
            Some(default) => format!("? {} ({}) ", message, default),
            None => format!("? {} ", message),
        };
        let answer = read_line(question).await?;
        Ok(text_or_default(&answer, default))
    }
}

async fn read_line(question: String) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        use std::io::Write;
        print!("{}", question);
        std::io::stdout().flush().context("Failed to flush stdout")?;

        let mut line = String::new();
        let read = std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read from stdin")?;
        if read == 0 {
            bail!("Input closed before an answer was given");
        }
        Ok(line)
    })
    .await
    .context("Prompt task panicked")?
}

/// Option picked by a 1-based number or by its id
fn select_option<'a>(answer: &str, options: &'a [ChoiceOption]) -> Option<&'a ChoiceOption> {
    let answer = answer.trim();
    if let Ok(number) = answer.parse::<usize>() {
        return number.checked_sub(1).and_then(|i| options.get(i));
    }
    options.iter().find(|option| option.id == answer)
}

fn text_or_default(answer: &str, default: Option<&str>) -> String {
    let answer = answer.trim_end_matches(['\r', '\n']);
    match default {
        Some(default) if answer.trim().is_empty() => default.to_string(),
        _ => answer.to_string(),
    }
}

/// Plain line-oriented progress output
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleOutput;

impl ExecutionOutput for ConsoleOutput {
    fn step_started(&self, label: &StepLabel) {
        let marker = if label.conditional { " (conditional)" } else { "" };
        println!("▶ {}{} [{}] {}", label, marker, label.kind, label.text);
    }

    fn output_line(&self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => println!("│ {}", line),
            OutputStream::Stderr => eprintln!("│ {}", line),
        }
    }

    fn step_finished(&self, label: &StepLabel, success: bool, duration: Duration) {
        let verdict = if success { "✓" } else { "✗" };
        println!("{} {} ({})", verdict, label, format_duration(duration));
    }

    fn buffered_result(&self, label: &StepLabel, outcome: &CommandOutcome) {
        self.step_started(label);
        for line in &outcome.stdout {
            self.output_line(OutputStream::Stdout, line);
        }
        for line in &outcome.stderr {
            self.output_line(OutputStream::Stderr, line);
        }
        self.step_finished(label, outcome.success, outcome.duration);
    }

    fn step_skipped(&self, label: &StepLabel) {
        println!("- {} skipped (condition not met)", label);
    }

    fn error(&self, message: &str) {
        eprintln!("✗ {}", message);
    }

    fn parallel_started(&self, label: &StepLabel, branches: usize) {
        println!("▶ {} running {} branches in parallel", label, branches);
    }

    fn parallel_finished(&self, label: &StepLabel, success: bool) {
        let verdict = if success { "✓" } else { "✗" };
        println!("{} {} parallel branches finished", verdict, label);
    }

    fn total_duration(&self, duration: Duration) {
        println!("Total execution time: {}", format_duration(duration));
    }

    fn timeline(&self, history: &History) {
        let lines = timeline_lines(history);
        if lines.is_empty() {
            return;
        }
        println!("Timeline:");
        for line in lines {
            println!("  {}", line);
        }
    }
}

fn timeline_lines(history: &History) -> Vec<String> {
    history
        .step_results()
        .filter_map(|event| {
            let (step_index, branch_index, resolved, duration_ms, passed) = match &event.event_type {
                EventType::StepCompleted {
                    step_index,
                    branch_index,
                    resolved,
                    duration_ms,
                    ..
                } => (step_index, branch_index, resolved, duration_ms, true),
                EventType::StepFailed {
                    step_index,
                    branch_index,
                    resolved,
                    duration_ms,
                    ..
                } => (step_index, branch_index, resolved, duration_ms, false),
                _ => return None,
            };

            let mut step = format!("Step {}", step_index + 1);
            if let Some(branch) = branch_index {
                step.push_str(&format!(" → branch {}", branch + 1));
            }
            let detail = match resolved {
                Some(ResolvedValue::Command(command)) => command.clone(),
                Some(ResolvedValue::Choice(id)) => format!("chose {}", id),
                Some(ResolvedValue::Prompt(value)) => format!("answered {}", value),
                None => String::new(),
            };
            let verdict = if passed { "✓" } else { "✗" };
            Some(format!(
                "{} {} {} ({}ms)",
                verdict,
                step,
                detail,
                duration_ms
            ))
        })
        .collect()
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        let secs = duration.as_secs();
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

/// Builds executors for scheduled runs, wired like an interactive run.
/// A detached daemon has no terminal, so its runs render into the log.
pub struct CliExecutorFactory {
    pub backoff: RetryBackoff,
    pub history: Arc<dyn HistorySink>,
    pub daemon_process: bool,
}

impl ExecutorFactory for CliExecutorFactory {
    fn create_executor(&self, silent: bool) -> WorkflowExecutor {
        let output: Arc<dyn ExecutionOutput> = match (silent, self.daemon_process) {
            (true, _) => Arc::new(SilentOutput),
            (false, true) => Arc::new(TracingOutput),
            (false, false) => Arc::new(ConsoleOutput),
        };
        WorkflowExecutor::new(Arc::new(StdinPrompt), output)
            .with_backoff(self.backoff)
            .with_history(self.history.clone())
    }
}

/// Scheduler progress for a foreground `schedule start`
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSchedulerOutput;

impl SchedulerOutput for ConsoleSchedulerOutput {
    fn scheduler_starting(&self, daemon_mode: bool) {
        if !daemon_mode {
            println!("Starting scheduler...");
        }
    }

    fn no_enabled_schedules(&self) {
        println!("No enabled schedules. Add one with `tp schedule add <file>`.");
    }

    fn schedule_registered(&self, schedule: &Schedule, zone: ScheduleZone, next: Option<DateTime<Utc>>) {
        let next = next
            .map(|time| time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  ✓ {} [{}] {} ({}), next run {}",
            schedule.display_name(),
            schedule.id,
            schedule.cron,
            zone,
            next
        );
    }

    fn schedule_rejected(&self, schedule_id: &str, reason: &str) {
        eprintln!("  ✗ {}: {}", schedule_id, reason);
    }

    fn scheduler_started(&self, daemon_mode: bool, pid: u32) {
        if !daemon_mode {
            println!("Scheduler running (PID: {}). Press Ctrl+C to stop.", pid);
        }
    }

    fn run_started(&self, name: &str, profile: Option<&str>) {
        match profile {
            Some(profile) => println!("Running scheduled workflow {} (profile {})", name, profile),
            None => println!("Running scheduled workflow {}", name),
        }
    }

    fn run_completed(&self, name: &str) {
        println!("✓ Scheduled workflow {} completed", name);
    }

    fn run_failed(&self, name: &str, error: &str) {
        eprintln!("✗ Scheduled workflow {} failed: {}", name, error);
    }

    fn scheduler_stopping(&self, daemon_mode: bool) {
        if !daemon_mode {
            println!("Stopping scheduler...");
        }
    }
}
